//! Whole runs through the system process runner, with shell scripts
//! standing in for the simulator, reconstructor and merge tool.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use pixsweep::config::CampaignConfig;
use pixsweep::core::naming::RunId;
use pixsweep::orchestration::{Campaign, SystemProcessRunner};
use pixsweep::state::RunManifest;

use crate::fixtures::Workspace;

const NPSIM: &str = r#"#!/bin/sh
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    --outputFile) out="$2"; shift ;;
  esac
  shift
done
echo "simulating into $out"
echo "geant4 warning" >&2
head -c 2000 /dev/zero > "$out"
"#;

const EICRECON: &str = r#"#!/bin/sh
for arg in "$@"; do
  case "$arg" in
    -Phistsfile=*) out="${arg#-Phistsfile=}" ;;
  esac
done
echo "plugins from $EICrecon_MY"
head -c 1500 /dev/zero > "$out"
"#;

const HADD: &str = r#"#!/bin/sh
out="$1"
shift
cat "$@" > "$out"
"#;

const BROKEN_EICRECON: &str = "#!/bin/sh\necho 'segfault' >&2\nexit 139\n";

fn install(path: &Path, script: &str) {
    fs::write(path, script).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn install_tools(ws: &Workspace, eicrecon: &str) {
    install(&ws.path("bin/npsim"), NPSIM);
    install(&ws.path("bin/eicrecon"), eicrecon);
    install(&ws.path("bin/hadd"), HADD);
}

#[tokio::test]
async fn test_scripts_produce_merged_output() {
    let ws = Workspace::new();
    install_tools(&ws, EICRECON);
    let cfg = CampaignConfig::load(&ws.write_config(&ws.raw_config())).unwrap();

    let summary = Campaign::new(cfg, Arc::new(SystemProcessRunner::new()))
        .with_run_id(RunId::new("20241006_153311"))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.counts.success, 12);
    let merged = summary.merged_output_path.clone().unwrap();
    assert_eq!(fs::metadata(&merged).unwrap().len(), 6 * 2000 + 6 * 1500);

    let sim_log = fs::read_to_string(
        summary
            .run_root
            .join("1.0x0.1px/logs/sim_beamEffectsElectrons_10.log"),
    )
    .unwrap();
    assert!(sim_log.contains("simulating into"));
    assert!(sim_log.contains("[stderr] geant4 warning"));

    let recon_log = fs::read_to_string(
        summary
            .run_root
            .join("2.0x0.1px/logs/recon_beamEffectsElectrons_20.log"),
    )
    .unwrap();
    assert!(recon_log.contains(&format!("plugins from {}", ws.path("plugins").display())));

    assert!(summary
        .run_root
        .join("1.0x0.1px/work/sim_beamEffectsElectrons_10")
        .is_dir());
}

#[tokio::test]
async fn test_crashing_reconstructor_exhausts_attempts() {
    let ws = Workspace::new();
    install_tools(&ws, BROKEN_EICRECON);
    let mut raw = ws.raw_config();
    raw.max_attempts = Some(2);
    let cfg = CampaignConfig::load(&ws.write_config(&raw)).unwrap();

    let summary = Campaign::new(cfg, Arc::new(SystemProcessRunner::new()))
        .with_run_id(RunId::new("20241006_153311"))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.counts.success, 6);
    assert_eq!(summary.counts.failed, 6);
    assert!(summary
        .failed_task_ids
        .iter()
        .all(|id| id.as_str().starts_with("recon/")));
    assert!(summary.merged_output_path.is_some());

    let manifest = RunManifest::load(&summary.run_root.join("manifest.json")).unwrap();
    let attempts = manifest.attempts_of(&summary.failed_task_ids[0]);
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|r| r.exit_code == Some(139) && !r.valid));
    assert!(attempts[0].stderr.contains("segfault"));
}
