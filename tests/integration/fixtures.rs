//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A temporary workspace with a detector tree, generator inputs and tools
//! - A stub process runner that writes artifacts instead of simulating
//! - Collecting scheduler events

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc;

use pixsweep::config::RawConfig;
use pixsweep::core::params::VariantParams;
use pixsweep::orchestration::{CommandSpec, ProcessRunner, SchedulerEvent, TaskResult};
use pixsweep::Result;

pub const ENERGIES: [&str; 3] = ["10", "15", "20"];
pub const FILE_TYPE: &str = "beamEffectsElectrons";

const LUMI_XML: &str = r#"<lccdd>
  <define>
    <constant name="LumiSpecTracker_pixelSize_dx" value="0.1*mm"/>
    <constant name="LumiSpecTracker_pixelSize_dy" value="0.1*mm"/>
    <constant name="LumiSpecTracker_Z" value="-6000*mm"/>
  </define>
</lccdd>
"#;

const ENTRY_XML: &str = r#"<lccdd>
  <include ref="{DETECTOR_PATH}/compact/lumi.xml"/>
</lccdd>
"#;

/// A temporary directory laid out like an operator's machine.
pub struct Workspace {
    pub temp_dir: TempDir,
    pub root: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let root = temp_dir.path().to_path_buf();

        let epic = root.join("epic");
        fs::create_dir_all(epic.join("compact")).unwrap();
        fs::write(epic.join("epic_ip6_extended.xml"), ENTRY_XML).unwrap();
        fs::write(epic.join("compact/lumi.xml"), LUMI_XML).unwrap();
        fs::create_dir_all(epic.join("build")).unwrap();
        fs::write(epic.join("build/cache.bin"), "stale").unwrap();

        fs::create_dir_all(root.join("gen")).unwrap();
        for e in ENERGIES {
            fs::write(
                root.join("gen").join(format!("{}_{}.hepmc", FILE_TYPE, e)),
                "events",
            )
            .unwrap();
        }

        fs::create_dir_all(root.join("bin")).unwrap();
        for tool in ["npsim", "eicrecon", "hadd"] {
            fs::write(root.join("bin").join(tool), "#!/bin/sh\nexit 0\n").unwrap();
        }
        fs::create_dir_all(root.join("plugins")).unwrap();

        Self { temp_dir, root }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    fn path_str(&self, rel: &str) -> String {
        self.path(rel).to_string_lossy().into_owned()
    }

    /// Two variants, three energies discovered from `gen/`, reconstruction on.
    pub fn raw_config(&self) -> RawConfig {
        RawConfig {
            variants: Some(vec![VariantParams::new(1.0, 0.1), VariantParams::new(2.0, 0.1)]),
            input_dir: Some(self.path_str("gen")),
            file_type: Some(FILE_TYPE.to_string()),
            particle_count: Some(100),
            detector_source_path: Some(self.path_str("epic")),
            detector_entry: Some("epic_ip6_extended.xml".to_string()),
            simulator_binary: Some(self.path_str("bin/npsim")),
            reconstructor_binary: Some(self.path_str("bin/eicrecon")),
            merge_binary: Some(self.path_str("bin/hadd")),
            plugin_path: Some(self.path_str("plugins")),
            output_root: Some(self.path_str("runs")),
            workers: Some(2),
            ..RawConfig::default()
        }
    }

    /// Write `raw` as a JSON config file and return its path.
    pub fn write_config(&self, raw: &RawConfig) -> PathBuf {
        let path = self.path("campaign.json");
        fs::write(&path, serde_json::to_string_pretty(raw).unwrap()).unwrap();
        path
    }
}

/// In-process stand-in for the external tools.
///
/// Writes the artifact each command names. Artifacts of `small_variant`
/// are written below the validation threshold. With `failing_merge` the
/// merge tool exits 1 without writing anything.
pub struct StubRunner {
    pub small_variant: Option<&'static str>,
    pub failing_merge: bool,
    pub invocations: AtomicUsize,
    pub merge_inputs: Mutex<Vec<PathBuf>>,
}

impl StubRunner {
    pub fn new() -> Self {
        Self {
            small_variant: None,
            failing_merge: false,
            invocations: AtomicUsize::new(0),
            merge_inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn with_small_variant(variant_key: &'static str) -> Self {
        Self {
            small_variant: Some(variant_key),
            ..Self::new()
        }
    }

    pub fn with_failing_merge() -> Self {
        Self {
            failing_merge: true,
            ..Self::new()
        }
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    fn size_for(&self, out: &Path) -> usize {
        match self.small_variant {
            Some(v) if out.to_string_lossy().contains(&format!("/{}px/", v)) => 10,
            _ => 2000,
        }
    }
}

impl ProcessRunner for StubRunner {
    fn run(&self, cmd: &CommandSpec, _work_dir: &Path, log_path: &Path) -> Result<TaskResult> {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        let out = if let Some(out) = cmd.flag_value("--outputFile") {
            PathBuf::from(out)
        } else if let Some(out) = cmd.args.iter().find_map(|a| a.strip_prefix("-Phistsfile=")) {
            PathBuf::from(out)
        } else {
            *self.merge_inputs.lock().unwrap() = cmd.args[1..].iter().map(PathBuf::from).collect();
            if self.failing_merge {
                return Ok(TaskResult {
                    exit_code: Some(1),
                    stderr: "Error in <TFileMerger>: cannot open inputs".to_string(),
                    error: Some("exited with code 1".to_string()),
                    ..TaskResult::default()
                });
            }
            PathBuf::from(&cmd.args[0])
        };

        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(log_path, format!("{}\n", cmd))?;
        fs::write(&out, vec![0u8; self.size_for(&out)])?;

        Ok(TaskResult {
            exit_code: Some(0),
            stdout: format!("wrote {}", out.display()),
            ..TaskResult::default()
        })
    }
}

/// Receive every event already sent on `rx`.
pub fn drain_events(rx: &mut mpsc::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
