//! Sweep parameters: detector variants and energy inputs.
//!
//! Both types own a canonical key. The key is the only identity used for
//! directories, task ids and artifact names, so it is produced here and
//! nowhere else.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::LazyLock;

/// Names of the geometry constants a variant overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeometrySettings {
    #[serde(default = "default_dx_constant")]
    pub dx_constant: String,
    #[serde(default = "default_dy_constant")]
    pub dy_constant: String,
    /// Unit suffix written after each value, e.g. `0.1*mm`.
    #[serde(default = "default_unit")]
    pub unit: String,
}

fn default_dx_constant() -> String {
    "LumiSpecTracker_pixelSize_dx".to_string()
}

fn default_dy_constant() -> String {
    "LumiSpecTracker_pixelSize_dy".to_string()
}

fn default_unit() -> String {
    "mm".to_string()
}

impl Default for GeometrySettings {
    fn default() -> Self {
        Self {
            dx_constant: default_dx_constant(),
            dy_constant: default_dy_constant(),
            unit: default_unit(),
        }
    }
}

/// One point in the pixel-size sweep.
///
/// Serialized as a `[dx, dy]` pair; anything else is rejected when parsed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "[f64; 2]")]
pub struct VariantParams {
    pub dx: f64,
    pub dy: f64,
}

impl VariantParams {
    pub fn new(dx: f64, dy: f64) -> Self {
        Self { dx, dy }
    }

    /// Canonical identity, e.g. `1.0x0.1`.
    ///
    /// `{:?}` keeps the trailing `.0` on whole numbers so `1.0` and `1` never
    /// produce different keys for the same value.
    pub fn key(&self) -> String {
        format!("{:?}x{:?}", self.dx, self.dy)
    }

    pub fn is_valid(&self) -> bool {
        self.dx.is_finite() && self.dy.is_finite() && self.dx > 0.0 && self.dy > 0.0
    }

    /// Named geometry parameters this variant sets.
    pub fn overrides(&self, geometry: &GeometrySettings) -> BTreeMap<String, f64> {
        BTreeMap::from([
            (geometry.dx_constant.clone(), self.dx),
            (geometry.dy_constant.clone(), self.dy),
        ])
    }
}

impl TryFrom<Vec<f64>> for VariantParams {
    type Error = String;

    fn try_from(pair: Vec<f64>) -> std::result::Result<Self, Self::Error> {
        match pair.as_slice() {
            [dx, dy] => Ok(Self::new(*dx, *dy)),
            other => Err(format!(
                "variant pair must have exactly 2 numeric components, got {}",
                other.len()
            )),
        }
    }
}

impl From<VariantParams> for [f64; 2] {
    fn from(v: VariantParams) -> Self {
        [v.dx, v.dy]
    }
}

impl std::fmt::Display for VariantParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// One generator input: a particle file at a given beam energy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnergySpec {
    /// Energy label as written in the input name, e.g. `10` or `10.5`.
    pub energy: String,
    pub file_type: String,
    pub input: PathBuf,
}

/// `<energy>.<ext>` tail of a generator file name.
static INPUT_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+(?:\.\d+)?)\.[A-Za-z][\w.]*$").unwrap());

impl EnergySpec {
    pub fn new(energy: &str, file_type: &str, input: impl Into<PathBuf>) -> Self {
        Self {
            energy: energy.to_string(),
            file_type: file_type.to_string(),
            input: input.into(),
        }
    }

    /// Canonical identity, e.g. `beamEffectsElectrons_10`.
    pub fn key(&self) -> String {
        format!("{}_{}", self.file_type, self.energy)
    }

    /// Recover the energy label from a generator file named
    /// `<file_type>_<energy>.<ext>`.
    pub fn parse_file_name(file_name: &str, file_type: &str) -> Option<String> {
        let rest = file_name.strip_prefix(file_type)?.strip_prefix('_')?;
        let caps = INPUT_NAME_RE.captures(rest)?;
        Some(caps[1].to_string())
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.file_type.is_empty() || self.file_type.contains('/') {
            return Err(format!("invalid file_type {:?}", self.file_type));
        }
        if !is_energy_label(&self.energy) {
            return Err(format!(
                "energy {:?} must be a non-negative number",
                self.energy
            ));
        }
        Ok(())
    }
}

fn is_energy_label(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| c.is_ascii_digit() || c == '.')
        && s.parse::<f64>().map(|v| v.is_finite()).unwrap_or(false)
}
