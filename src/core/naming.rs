//! Run identity and on-disk naming.
//!
//! Every path the campaign writes is derived here. `expand` and the
//! archive both build names through [`RunLayout`] and never parse them
//! back out of the file system.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::core::task::TaskKind;
use crate::error::Result;

/// Timestamp-derived identifier of one campaign run, e.g. `20241006_153311`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub const FORMAT: &'static str = "%Y%m%d_%H%M%S";

    pub fn now() -> Self {
        Self(Local::now().format(Self::FORMAT).to_string())
    }

    pub fn new(id: &str) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn with_suffix(&self, n: u32) -> Self {
        Self(format!("{}_{}", self.0, n))
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

const SIM_PREFIX: &str = "output_";
const SIM_SUFFIX: &str = ".edm4hep.root";
const RECON_PREFIX: &str = "recon_";
const RECON_SUFFIX: &str = ".root";
const VARIANT_DIR_SUFFIX: &str = "px";

/// File name of a task artifact: which stage wrote it and for which energy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    pub kind: TaskKind,
    pub energy_key: String,
}

impl ArtifactName {
    pub fn new(kind: TaskKind, energy_key: &str) -> Self {
        Self {
            kind,
            energy_key: energy_key.to_string(),
        }
    }

    pub fn encode(&self) -> String {
        match self.kind {
            TaskKind::Simulate => format!("{}{}{}", SIM_PREFIX, self.energy_key, SIM_SUFFIX),
            TaskKind::Reconstruct => {
                format!("{}{}{}", RECON_PREFIX, self.energy_key, RECON_SUFFIX)
            }
        }
    }

    /// Per-task log file name, e.g. `sim_beamEffectsElectrons_10.log`.
    pub fn log_name(&self) -> String {
        format!("{}_{}.log", self.kind.prefix(), self.energy_key)
    }
}

/// Directory layout of one run under the output root.
///
/// ```text
/// <output_root>/<run_id>/
///     manifest.json  README.txt  merged_output.root
///     <variant>px/
///         output_<energy>.edm4hep.root
///         recon/recon_<energy>.root
///         logs/{sim,recon}_<energy>.log
///         work/{sim,recon}_<energy>/
///         detector/...
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    run_id: RunId,
    run_root: PathBuf,
}

impl RunLayout {
    pub fn new(output_root: &Path, run_id: RunId) -> Self {
        let run_root = output_root.join(run_id.as_str());
        Self { run_id, run_root }
    }

    /// Create the run root for `run_id` under `output_root` and return its
    /// layout. The directory is created with `create_dir`, so an existing
    /// run is never reused: on a clash the id gains `_1`, `_2`, ... until a
    /// free name is claimed.
    pub fn claim(output_root: &Path, run_id: RunId) -> Result<Self> {
        fs::create_dir_all(output_root)?;
        let mut candidate = run_id.clone();
        let mut n = 0;
        loop {
            let layout = Self::new(output_root, candidate);
            match fs::create_dir(&layout.run_root) {
                Ok(()) => return Ok(layout),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    n += 1;
                    candidate = run_id.with_suffix(n);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn run_root(&self) -> &Path {
        &self.run_root
    }

    pub fn variant_dir_name(variant_key: &str) -> String {
        format!("{}{}", variant_key, VARIANT_DIR_SUFFIX)
    }

    pub fn variant_dir(&self, variant_key: &str) -> PathBuf {
        self.run_root.join(Self::variant_dir_name(variant_key))
    }

    pub fn detector_dir(&self, variant_key: &str) -> PathBuf {
        self.variant_dir(variant_key).join("detector")
    }

    pub fn artifact_path(&self, kind: TaskKind, variant_key: &str, energy_key: &str) -> PathBuf {
        let name = ArtifactName::new(kind, energy_key).encode();
        match kind {
            TaskKind::Simulate => self.variant_dir(variant_key).join(name),
            TaskKind::Reconstruct => self.variant_dir(variant_key).join("recon").join(name),
        }
    }

    pub fn log_path(&self, kind: TaskKind, variant_key: &str, energy_key: &str) -> PathBuf {
        self.variant_dir(variant_key)
            .join("logs")
            .join(ArtifactName::new(kind, energy_key).log_name())
    }

    /// Scratch directory the tool runs in, one per task.
    pub fn work_dir(&self, kind: TaskKind, variant_key: &str, energy_key: &str) -> PathBuf {
        self.variant_dir(variant_key)
            .join("work")
            .join(format!("{}_{}", kind.prefix(), energy_key))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.run_root.join("manifest.json")
    }

    pub fn merged_output_path(&self) -> PathBuf {
        self.run_root.join("merged_output.root")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> RunLayout {
        RunLayout::new(Path::new("/out"), RunId::new("20241006_153311"))
    }

    #[test]
    fn test_run_id_now_matches_format() {
        let id = RunId::now();
        assert_eq!(id.as_str().len(), "20241006_153311".len());
        assert_eq!(id.as_str().chars().nth(8), Some('_'));
        assert!(chrono::NaiveDateTime::parse_from_str(id.as_str(), RunId::FORMAT).is_ok());
    }

    #[test]
    fn test_run_id_serializes_transparent() {
        let json = serde_json::to_string(&RunId::new("20240101_000000")).unwrap();
        assert_eq!(json, "\"20240101_000000\"");
    }

    #[test]
    fn test_artifact_encode() {
        assert_eq!(
            ArtifactName::new(TaskKind::Simulate, "beamEffectsElectrons_10").encode(),
            "output_beamEffectsElectrons_10.edm4hep.root"
        );
        assert_eq!(
            ArtifactName::new(TaskKind::Reconstruct, "beamEffectsElectrons_10").encode(),
            "recon_beamEffectsElectrons_10.root"
        );
    }

    #[test]
    fn test_log_name() {
        assert_eq!(
            ArtifactName::new(TaskKind::Simulate, "e_10").log_name(),
            "sim_e_10.log"
        );
        assert_eq!(
            ArtifactName::new(TaskKind::Reconstruct, "e_10").log_name(),
            "recon_e_10.log"
        );
    }

    #[test]
    fn test_layout_paths() {
        let layout = layout();
        assert_eq!(layout.run_root(), Path::new("/out/20241006_153311"));
        assert_eq!(
            layout.variant_dir("1.0x0.1"),
            PathBuf::from("/out/20241006_153311/1.0x0.1px")
        );
        assert_eq!(
            layout.artifact_path(TaskKind::Simulate, "1.0x0.1", "e_10"),
            PathBuf::from("/out/20241006_153311/1.0x0.1px/output_e_10.edm4hep.root")
        );
        assert_eq!(
            layout.artifact_path(TaskKind::Reconstruct, "1.0x0.1", "e_10"),
            PathBuf::from("/out/20241006_153311/1.0x0.1px/recon/recon_e_10.root")
        );
        assert_eq!(
            layout.log_path(TaskKind::Reconstruct, "1.0x0.1", "e_10"),
            PathBuf::from("/out/20241006_153311/1.0x0.1px/logs/recon_e_10.log")
        );
        assert_eq!(
            layout.work_dir(TaskKind::Simulate, "1.0x0.1", "e_10"),
            PathBuf::from("/out/20241006_153311/1.0x0.1px/work/sim_e_10")
        );
        assert_eq!(
            layout.detector_dir("1.0x0.1"),
            PathBuf::from("/out/20241006_153311/1.0x0.1px/detector")
        );
    }

    #[test]
    fn test_variant_dir_name() {
        assert_eq!(RunLayout::variant_dir_name("2.0x0.1"), "2.0x0.1px");
    }

    #[test]
    fn test_claim_never_reuses_run_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let output_root = dir.path().join("runs");
        let id = RunId::new("20241006_153311");

        let first = RunLayout::claim(&output_root, id.clone()).unwrap();
        let second = RunLayout::claim(&output_root, id.clone()).unwrap();
        let third = RunLayout::claim(&output_root, id).unwrap();

        assert_eq!(first.run_id().as_str(), "20241006_153311");
        assert_eq!(second.run_id().as_str(), "20241006_153311_1");
        assert_eq!(third.run_id().as_str(), "20241006_153311_2");
        assert_eq!(second.run_root(), output_root.join("20241006_153311_1"));
        assert!(first.run_root().is_dir());
        assert!(third.run_root().is_dir());
    }

    #[test]
    fn test_claim_fails_when_output_root_is_a_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("runs");
        fs::write(&blocker, "x").unwrap();
        assert!(RunLayout::claim(&blocker, RunId::new("20241006_153311")).is_err());
    }
}
