use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::core::params::{EnergySpec, GeometrySettings, VariantParams};
use crate::core::task::TaskKind;
use crate::orchestration::retry::DEFAULT_MAX_ATTEMPTS;
use crate::orchestration::validator::DEFAULT_MIN_OUTPUT_BYTES;
use crate::util::{available_cpus, expand_tilde};
use crate::{plog, plog_debug, Error, Result};

const DEFAULT_SIMULATOR: &str = "npsim";
const DEFAULT_RECONSTRUCTOR: &str = "eicrecon";
const DEFAULT_MERGE: &str = "hadd";
const DEFAULT_PLUGIN: &str = "analyzeLumiHits";

/// Which successful artifacts feed the final merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeSelection {
    /// Every successful artifact, simulation and reconstruction alike.
    #[default]
    All,
    Simulate,
    Reconstruct,
}

impl MergeSelection {
    pub fn includes(&self, kind: TaskKind) -> bool {
        match self {
            MergeSelection::All => true,
            MergeSelection::Simulate => kind == TaskKind::Simulate,
            MergeSelection::Reconstruct => kind == TaskKind::Reconstruct,
        }
    }
}

/// Validated campaign configuration. Loaded once and shared read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    pub variants: Vec<VariantParams>,
    pub energies: Vec<EnergySpec>,
    pub particle_count: u32,
    pub detector_source_path: PathBuf,
    /// Compact file inside the detector tree, relative to its root.
    pub detector_entry: PathBuf,
    pub simulator_binary: PathBuf,
    pub reconstructor_binary: PathBuf,
    pub merge_binary: PathBuf,
    pub plugin_path: Option<PathBuf>,
    pub plugins: Vec<String>,
    pub output_root: PathBuf,
    pub enable_reconstruction: bool,
    pub workers: Option<usize>,
    pub max_attempts: u32,
    pub serial_fallback: bool,
    pub min_output_bytes: u64,
    pub merge_selection: MergeSelection,
    pub geometry: GeometrySettings,
    pub backup_root: Option<PathBuf>,
}

impl CampaignConfig {
    /// Load and validate a JSON or TOML config file.
    ///
    /// A missing file is replaced by a default template and reported as
    /// [`Error::ConfigMissing`] so the operator can fill it in.
    pub fn load(path: &Path) -> Result<Self> {
        plog_debug!("CampaignConfig::load path={}", path.display());
        if !path.exists() {
            if RawConfig::write_default(path)? {
                plog!("Wrote default configuration to {}", path.display());
            }
            return Err(Error::ConfigMissing {
                path: path.to_path_buf(),
            });
        }

        let text = fs::read_to_string(path)?;
        let raw = RawConfig::parse(&text, ConfigFormat::from_path(path))
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config = raw.validate()?;
        plog!(
            "Config loaded: {} variants, {} energies, {} particles, workers={}",
            config.variants.len(),
            config.energies.len(),
            config.particle_count,
            config.effective_workers()
        );
        Ok(config)
    }

    /// Worker slots actually used: the requested count capped at the CPU count.
    pub fn effective_workers(&self) -> usize {
        let cpus = available_cpus();
        self.workers.unwrap_or(cpus).min(cpus).max(1)
    }

    /// Base detector compact file, e.g. `<source>/epic_ip6_extended.xml`.
    pub fn detector_entry_path(&self) -> PathBuf {
        self.detector_source_path.join(&self.detector_entry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    /// `.json` files are JSON; everything else is TOML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Toml,
        }
    }
}

/// Energy label as written by hand: `10`, `18.5` or `"10"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnergyLabel {
    Number(f64),
    Text(String),
}

impl std::fmt::Display for EnergyLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnergyLabel::Number(n) => write!(f, "{}", n),
            EnergyLabel::Text(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEnergy {
    pub energy: EnergyLabel,
    /// Falls back to the top-level `file_type`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    /// Relative paths resolve against `input_dir`.
    pub input: String,
}

/// Unvalidated configuration as written on disk. Every field is optional so
/// that [`validate`](Self::validate) can report all problems at once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variants: Option<Vec<VariantParams>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energies: Option<Vec<RawEnergy>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub particle_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detector_source_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detector_entry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulator_binary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconstructor_binary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_binary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_reconstruction: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_fallback: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_output_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_selection: Option<MergeSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<GeometrySettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_root: Option<String>,
}

impl RawConfig {
    pub fn parse(text: &str, format: ConfigFormat) -> Result<Self> {
        Ok(match format {
            ConfigFormat::Json => serde_json::from_str(text)?,
            ConfigFormat::Toml => toml::from_str(text)?,
        })
    }

    /// Starting point written for a missing config file.
    pub fn template() -> Self {
        Self {
            variants: Some(vec![VariantParams::new(1.0, 0.1), VariantParams::new(2.0, 0.1)]),
            energies: None,
            input_dir: Some("~/eic/generatorFiles".to_string()),
            file_type: Some("beamEffectsElectrons".to_string()),
            particle_count: Some(5000),
            detector_source_path: Some("~/eic/epic".to_string()),
            detector_entry: Some("epic_ip6_extended.xml".to_string()),
            simulator_binary: Some(DEFAULT_SIMULATOR.to_string()),
            reconstructor_binary: Some(DEFAULT_RECONSTRUCTOR.to_string()),
            merge_binary: Some(DEFAULT_MERGE.to_string()),
            plugin_path: Some("~/eic/EICreconPlugins".to_string()),
            plugins: Some(vec![DEFAULT_PLUGIN.to_string()]),
            output_root: Some("~/eic/simulations".to_string()),
            enable_reconstruction: Some(true),
            workers: None,
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            serial_fallback: Some(true),
            min_output_bytes: Some(DEFAULT_MIN_OUTPUT_BYTES),
            merge_selection: Some(MergeSelection::All),
            geometry: Some(GeometrySettings::default()),
            backup_root: None,
        }
    }

    pub fn render(&self, format: ConfigFormat) -> Result<String> {
        Ok(match format {
            ConfigFormat::Json => serde_json::to_string_pretty(self)?,
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
        })
    }

    /// Write the template to `path` unless something is already there.
    /// Returns whether a file was written.
    pub fn write_default(path: &Path) -> Result<bool> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let contents = Self::template().render(ConfigFormat::from_path(path))?;
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        file.write_all(contents.as_bytes())?;
        Ok(true)
    }

    /// Check every field and build the validated config.
    ///
    /// All problems are collected and reported together as one
    /// [`Error::Config`].
    pub fn validate(self) -> Result<CampaignConfig> {
        let mut problems: Vec<String> = Vec::new();
        let enable_reconstruction = self.enable_reconstruction.unwrap_or(true);

        // Variants
        let variants = self.variants.unwrap_or_default();
        if variants.is_empty() {
            problems.push("variants: at least one [dx, dy] pair is required".to_string());
        }
        let mut variant_keys = HashSet::new();
        for v in &variants {
            if !v.is_valid() {
                problems.push(format!(
                    "variants: {} must have finite, positive components",
                    v
                ));
            }
            if !variant_keys.insert(v.key()) {
                problems.push(format!("variants: duplicate variant {}", v.key()));
            }
        }

        // Energies: explicit list, or discovered from input_dir
        let input_dir = self.input_dir.as_deref().map(expand_tilde);
        let energies = match self.energies {
            Some(list) if !list.is_empty() => {
                resolve_energies(list, input_dir.as_deref(), self.file_type.as_deref(), &mut problems)
            }
            _ => match (&input_dir, self.file_type.as_deref()) {
                (Some(dir), Some(file_type)) => match discover_energies(dir, file_type) {
                    Ok(found) => found,
                    Err(e) => {
                        problems.push(format!("input_dir: {}", e));
                        Vec::new()
                    }
                },
                _ => Vec::new(),
            },
        };
        if energies.is_empty() {
            problems.push(
                "energies: at least one energy is required (list them or set input_dir and file_type)"
                    .to_string(),
            );
        }
        let mut energy_keys = HashSet::new();
        for e in &energies {
            if let Err(msg) = e.validate() {
                problems.push(format!("energies: {}", msg));
            }
            if !energy_keys.insert(e.key()) {
                problems.push(format!("energies: duplicate energy {}", e.key()));
            }
            if !e.input.is_file() {
                problems.push(format!(
                    "energies: input {} does not exist",
                    e.input.display()
                ));
            }
        }

        let particle_count = match self.particle_count {
            Some(0) => {
                problems.push("particle_count must be > 0".to_string());
                0
            }
            Some(n) => n,
            None => {
                problems.push("particle_count is required".to_string());
                0
            }
        };

        // Detector tree
        let detector_source_path = match self.detector_source_path.as_deref().map(expand_tilde) {
            Some(p) if p.is_dir() => p,
            Some(p) => {
                problems.push(format!(
                    "detector_source_path: {} is not a directory",
                    p.display()
                ));
                p
            }
            None => {
                problems.push("detector_source_path is required".to_string());
                PathBuf::new()
            }
        };
        let detector_entry = match self.detector_entry.map(PathBuf::from) {
            Some(entry) if entry.is_absolute() => {
                problems.push(format!(
                    "detector_entry: {} must be relative to detector_source_path",
                    entry.display()
                ));
                entry
            }
            Some(entry) => {
                let full = detector_source_path.join(&entry);
                if detector_source_path.is_dir() && !full.is_file() {
                    problems.push(format!("detector_entry: {} does not exist", full.display()));
                }
                entry
            }
            None => {
                problems.push("detector_entry is required".to_string());
                PathBuf::new()
            }
        };

        // External tools
        let simulator_binary = resolve_binary(
            "simulator_binary",
            self.simulator_binary.as_deref().unwrap_or(DEFAULT_SIMULATOR),
            &mut problems,
        );
        let merge_binary = resolve_binary(
            "merge_binary",
            self.merge_binary.as_deref().unwrap_or(DEFAULT_MERGE),
            &mut problems,
        );
        let reconstructor = self
            .reconstructor_binary
            .as_deref()
            .unwrap_or(DEFAULT_RECONSTRUCTOR);
        let reconstructor_binary = if enable_reconstruction {
            resolve_binary("reconstructor_binary", reconstructor, &mut problems)
        } else {
            expand_tilde(reconstructor)
        };

        let plugin_path = self.plugin_path.as_deref().map(expand_tilde);
        if enable_reconstruction {
            match &plugin_path {
                Some(p) if !p.exists() => {
                    problems.push(format!("plugin_path: {} does not exist", p.display()))
                }
                Some(_) => {}
                None => problems
                    .push("plugin_path is required when reconstruction is enabled".to_string()),
            }
        }
        let plugins = self
            .plugins
            .unwrap_or_else(|| vec![DEFAULT_PLUGIN.to_string()]);
        if enable_reconstruction && plugins.is_empty() {
            problems.push("plugins: at least one reconstruction plugin is required".to_string());
        }

        let output_root = match self.output_root.as_deref().map(expand_tilde) {
            Some(p) => p,
            None => {
                problems.push("output_root is required".to_string());
                PathBuf::new()
            }
        };

        if self.workers == Some(0) {
            problems.push("workers must be > 0 when set".to_string());
        }
        let max_attempts = self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if max_attempts == 0 {
            problems.push("max_attempts must be >= 1".to_string());
        }

        let geometry = self.geometry.unwrap_or_default();
        if geometry.dx_constant.is_empty() || geometry.dy_constant.is_empty() {
            problems.push("geometry: constant names must not be empty".to_string());
        }

        if !problems.is_empty() {
            return Err(Error::Config(problems.join("; ")));
        }

        plog_debug!(
            "Config validated: detector={} output_root={}",
            detector_source_path.display(),
            output_root.display()
        );

        Ok(CampaignConfig {
            variants,
            energies,
            particle_count,
            detector_source_path,
            detector_entry,
            simulator_binary,
            reconstructor_binary,
            merge_binary,
            plugin_path,
            plugins,
            output_root,
            enable_reconstruction,
            workers: self.workers,
            max_attempts,
            serial_fallback: self.serial_fallback.unwrap_or(true),
            min_output_bytes: self.min_output_bytes.unwrap_or(DEFAULT_MIN_OUTPUT_BYTES),
            merge_selection: self.merge_selection.unwrap_or_default(),
            geometry,
            backup_root: self.backup_root.as_deref().map(expand_tilde),
        })
    }
}

fn resolve_energies(
    list: Vec<RawEnergy>,
    input_dir: Option<&Path>,
    default_type: Option<&str>,
    problems: &mut Vec<String>,
) -> Vec<EnergySpec> {
    let mut out = Vec::with_capacity(list.len());
    for raw in list {
        let energy = raw.energy.to_string();
        let Some(file_type) = raw.file_type.as_deref().or(default_type) else {
            problems.push(format!("energies: {} has no file_type", energy));
            continue;
        };
        let mut input = expand_tilde(&raw.input);
        if input.is_relative() {
            if let Some(dir) = input_dir {
                input = dir.join(input);
            }
        }
        out.push(EnergySpec::new(&energy, file_type, input));
    }
    out
}

/// Build one [`EnergySpec`] per `<file_type>_<energy>.<ext>` file in `dir`,
/// sorted by numeric energy.
pub fn discover_energies(dir: &Path, file_type: &str) -> Result<Vec<EnergySpec>> {
    plog_debug!("Discovering {} inputs in {}", file_type, dir.display());
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(energy) = EnergySpec::parse_file_name(name, file_type) {
            found.push(EnergySpec::new(&energy, file_type, entry.path()));
        }
    }
    found.sort_by(|a, b| {
        let (x, y) = (
            a.energy.parse::<f64>().unwrap_or(f64::MAX),
            b.energy.parse::<f64>().unwrap_or(f64::MAX),
        );
        x.total_cmp(&y).then_with(|| a.input.cmp(&b.input))
    });
    Ok(found)
}

/// Resolve a tool: bare names go through `PATH`, anything with a separator
/// must exist as given.
fn resolve_binary(field: &str, value: &str, problems: &mut Vec<String>) -> PathBuf {
    if value.contains('/') || value.starts_with('~') {
        let path = expand_tilde(value);
        if !path.is_file() {
            problems.push(format!("{}: {} does not exist", field, path.display()));
        }
        return path;
    }
    match which::which(value) {
        Ok(path) => path,
        Err(e) => {
            problems.push(format!("{}: {} not found on PATH ({})", field, value, e));
            PathBuf::from(value)
        }
    }
}
