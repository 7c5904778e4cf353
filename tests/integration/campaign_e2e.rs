//! End-to-end campaign runs with the stub runner.

use std::fs;
use std::sync::Arc;

use pixsweep::config::CampaignConfig;
use pixsweep::core::params::VariantParams;
use pixsweep::core::naming::RunId;
use pixsweep::core::task::TaskStatus;
use pixsweep::orchestration::Campaign;
use pixsweep::state::RunManifest;
use pixsweep::Error;

use crate::fixtures::{StubRunner, Workspace};

const RUN_ID: &str = "20241006_153311";

#[tokio::test]
async fn test_all_tasks_succeed() {
    let ws = Workspace::new();
    let cfg = CampaignConfig::load(&ws.write_config(&ws.raw_config())).unwrap();
    let runner = Arc::new(StubRunner::new());

    let summary = Campaign::new(cfg, runner.clone())
        .with_run_id(RunId::new(RUN_ID))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.counts.success, 12);
    assert_eq!(summary.counts.failed, 0);
    assert_eq!(summary.counts.skipped, 0);
    assert!(summary.failed_task_ids.is_empty());
    assert_eq!(
        summary.merged_output_path,
        Some(ws.path("runs").join(RUN_ID).join("merged_output.root"))
    );
    assert_eq!(runner.invocation_count(), 13);
    assert_eq!(runner.merge_inputs.lock().unwrap().len(), 12);

    let manifest = RunManifest::load(&summary.run_root.join("manifest.json")).unwrap();
    assert!(manifest.is_finalized());
    assert_eq!(manifest.task_results.len(), 12);
    assert!(manifest.task_results.iter().all(|r| r.valid && r.attempt == 1));
    assert!(manifest.merge_result.as_ref().is_some_and(|r| r.valid));
    assert!(summary.run_root.join("README.txt").is_file());
}

#[tokio::test]
async fn test_variant_copies_are_rewritten_and_base_untouched() {
    let ws = Workspace::new();
    let cfg = CampaignConfig::load(&ws.write_config(&ws.raw_config())).unwrap();
    let before = fs::read_to_string(ws.path("epic/compact/lumi.xml")).unwrap();

    let summary = Campaign::new(cfg, Arc::new(StubRunner::new()))
        .with_run_id(RunId::new(RUN_ID))
        .run()
        .await
        .unwrap();

    assert_eq!(fs::read_to_string(ws.path("epic/compact/lumi.xml")).unwrap(), before);

    let detector = summary.run_root.join("2.0x0.1px/detector");
    let lumi = fs::read_to_string(detector.join("compact/lumi.xml")).unwrap();
    assert!(lumi.contains(r#"name="LumiSpecTracker_pixelSize_dx" value="2.0*mm""#));
    assert!(lumi.contains(r#"name="LumiSpecTracker_pixelSize_dy" value="0.1*mm""#));
    assert!(lumi.contains(r#"value="-6000*mm""#));

    let entry = fs::read_to_string(detector.join("epic_ip6_extended.xml")).unwrap();
    assert!(entry.contains(&detector.display().to_string()));
    assert!(!entry.contains("{DETECTOR_PATH}"));
    assert!(!detector.join("build").exists());
}

#[tokio::test]
async fn test_variant_under_threshold_fails_and_is_left_out_of_merge() {
    let ws = Workspace::new();
    let cfg = CampaignConfig::load(&ws.write_config(&ws.raw_config())).unwrap();
    let runner = Arc::new(StubRunner::with_small_variant("2.0x0.1"));

    let summary = Campaign::new(cfg, runner.clone())
        .with_run_id(RunId::new(RUN_ID))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.counts.success, 6);
    assert_eq!(summary.counts.failed, 3);
    assert_eq!(summary.counts.skipped, 3);
    assert!(summary
        .failed_task_ids
        .iter()
        .all(|id| id.as_str().starts_with("sim/2.0x0.1/")));
    assert!(summary
        .skipped_task_ids
        .iter()
        .all(|id| id.as_str().starts_with("recon/2.0x0.1/")));

    let merged: Vec<String> = runner
        .merge_inputs
        .lock()
        .unwrap()
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    assert_eq!(merged.len(), 6);
    assert!(merged.iter().all(|p| p.contains("/1.0x0.1px/")));

    let manifest = RunManifest::load(&summary.run_root.join("manifest.json")).unwrap();
    for record in manifest.tasks.iter().filter(|r| r.variant_key == "2.0x0.1") {
        match &record.status {
            TaskStatus::Failed { error } => {
                assert_eq!(record.attempts, 4);
                assert!(error.contains("below the 1000 byte threshold"));
                assert_eq!(manifest.attempts_of(&record.id).len(), 4);
            }
            TaskStatus::Skipped { reason } => {
                assert_eq!(record.attempts, 0);
                assert!(reason.contains("sim/2.0x0.1/"));
            }
            other => panic!("{} ended as {}", record.id, other),
        }
    }

    let readme = fs::read_to_string(summary.run_root.join("README.txt")).unwrap();
    assert!(readme.contains("Failed:  3"));
    assert!(readme.contains("sim/2.0x0.1/beamEffectsElectrons_10"));
}

#[tokio::test]
async fn test_missing_detector_is_config_error_without_invocations() {
    let ws = Workspace::new();
    let mut raw = ws.raw_config();
    raw.detector_source_path = Some(ws.path("no-such-detector").to_string_lossy().into_owned());
    let runner = Arc::new(StubRunner::new());

    let result = CampaignConfig::load(&ws.write_config(&raw));
    let err = match result {
        Ok(cfg) => {
            let _ = Campaign::new(cfg, runner.clone()).run().await;
            panic!("config with a missing detector was accepted");
        }
        Err(e) => e,
    };

    assert!(err.is_config_error());
    assert!(matches!(&err, Error::Config(msg) if msg.contains("no-such-detector")));
    assert_eq!(runner.invocation_count(), 0);
    assert!(!ws.path("runs").exists());
}

#[tokio::test]
async fn test_missing_config_is_bootstrapped() {
    let ws = Workspace::new();
    let path = ws.path("fresh/campaign.toml");

    let err = CampaignConfig::load(&path).unwrap_err();
    assert!(matches!(err, Error::ConfigMissing { .. }));
    let written = fs::read_to_string(&path).unwrap();
    assert!(written.contains("particle_count"));

    fs::write(&path, "particle_count = 7\n").unwrap();
    let err = CampaignConfig::load(&path).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert_eq!(fs::read_to_string(&path).unwrap(), "particle_count = 7\n");
}

#[tokio::test]
async fn test_reconstruction_disabled_merges_simulations_only() {
    let ws = Workspace::new();
    let mut raw = ws.raw_config();
    raw.enable_reconstruction = Some(false);
    let cfg = CampaignConfig::load(&ws.write_config(&raw)).unwrap();
    let runner = Arc::new(StubRunner::new());

    let summary = Campaign::new(cfg, runner.clone())
        .with_run_id(RunId::new(RUN_ID))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.counts.success, 6);
    let merged = runner.merge_inputs.lock().unwrap().clone();
    assert_eq!(merged.len(), 6);
    assert!(merged
        .iter()
        .all(|p| p.to_string_lossy().ends_with(".edm4hep.root")));
}

#[tokio::test]
async fn test_backup_root_never_overwritten() {
    let ws = Workspace::new();
    let mut raw = ws.raw_config();
    raw.backup_root = Some(ws.path("archive").to_string_lossy().into_owned());
    let cfg = CampaignConfig::load(&ws.write_config(&raw)).unwrap();

    let first = Campaign::new(cfg.clone(), Arc::new(StubRunner::new()))
        .with_run_id(RunId::new(RUN_ID))
        .run()
        .await
        .unwrap();
    let second = Campaign::new(cfg, Arc::new(StubRunner::new()))
        .with_run_id(RunId::new(RUN_ID))
        .run()
        .await
        .unwrap();

    assert_eq!(second.run_id.as_str(), format!("{}_1", RUN_ID));
    assert_eq!(first.archive_dir, ws.path("archive").join(RUN_ID));
    assert_eq!(second.archive_dir, ws.path("archive").join(format!("{}_1", RUN_ID)));
    assert!(first
        .archive_dir
        .join("1.0x0.1px/recon/recon_beamEffectsElectrons_15.root")
        .is_file());
    assert!(!first.archive_dir.join("1.0x0.1px/detector").exists());
}

#[tokio::test]
async fn test_back_to_back_runs_get_separate_run_roots() {
    let ws = Workspace::new();
    let cfg = CampaignConfig::load(&ws.write_config(&ws.raw_config())).unwrap();

    let first = Campaign::new(cfg.clone(), Arc::new(StubRunner::new()))
        .run()
        .await
        .unwrap();
    let second = Campaign::new(cfg, Arc::new(StubRunner::with_small_variant("2.0x0.1")))
        .run()
        .await
        .unwrap();

    assert_ne!(first.run_root, second.run_root);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(second.run_root, ws.path("runs").join(second.run_id.as_str()));

    let first_manifest = RunManifest::load(&first.run_root.join("manifest.json")).unwrap();
    assert_eq!(first_manifest.run_id, first.run_id);
    assert!(first_manifest.is_finalized());
    assert_eq!(first_manifest.status_counts().success, 12);
    assert!(first_manifest.failed_task_ids.is_empty());
    assert!(first.run_root.join("2.0x0.1px/detector").is_dir());
    assert!(first.run_root.join("merged_output.root").is_file());

    let second_manifest = RunManifest::load(&second.run_root.join("manifest.json")).unwrap();
    assert_eq!(second_manifest.run_id, second.run_id);
    assert_eq!(second_manifest.failed_task_ids.len(), 3);
}

#[tokio::test]
async fn test_failing_merge_tool_still_finalizes_manifest() {
    let ws = Workspace::new();
    let cfg = CampaignConfig::load(&ws.write_config(&ws.raw_config())).unwrap();
    let runner = Arc::new(StubRunner::with_failing_merge());

    let summary = Campaign::new(cfg, runner.clone())
        .with_run_id(RunId::new(RUN_ID))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.counts.success, 12);
    assert_eq!(runner.invocation_count(), 13);
    assert_eq!(summary.merged_output_path, None);
    assert!(summary
        .merge_error
        .as_deref()
        .is_some_and(|e| e == "exited with code 1"));

    let manifest = RunManifest::load(&summary.run_root.join("manifest.json")).unwrap();
    assert!(manifest.is_finalized());
    assert_eq!(manifest.merged_output_path, None);
    assert_eq!(manifest.merge_error, summary.merge_error);
    assert_eq!(manifest.status_counts().success, 12);

    let readme = fs::read_to_string(summary.run_root.join("README.txt")).unwrap();
    assert!(readme.contains("Merge failed: exited with code 1"));
    assert!(!readme.contains("Merged output:"));
    assert!(summary.to_string().contains("merge failed: exited with code 1"));
}

#[tokio::test]
async fn test_no_successful_outputs_reports_merge_failure() {
    let ws = Workspace::new();
    let mut raw = ws.raw_config();
    raw.variants = Some(vec![VariantParams::new(2.0, 0.1)]);
    raw.max_attempts = Some(1);
    raw.serial_fallback = Some(false);
    let cfg = CampaignConfig::load(&ws.write_config(&raw)).unwrap();
    let runner = Arc::new(StubRunner::with_small_variant("2.0x0.1"));

    let summary = Campaign::new(cfg, runner.clone())
        .with_run_id(RunId::new(RUN_ID))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.counts.success, 0);
    assert_eq!(summary.counts.failed, 3);
    assert_eq!(summary.counts.skipped, 3);
    assert_eq!(runner.invocation_count(), 3, "merge tool is never started");

    let manifest = RunManifest::load(&summary.run_root.join("manifest.json")).unwrap();
    assert!(manifest.is_finalized());
    assert_eq!(manifest.merged_output_path, None);
    assert!(manifest.merge_result.is_none());
    assert!(manifest
        .merge_error
        .as_deref()
        .is_some_and(|e| e.contains("no successful outputs to merge")));

    let readme = fs::read_to_string(summary.run_root.join("README.txt")).unwrap();
    assert!(readme.contains("Merge failed"));
    assert!(readme.contains("no successful outputs to merge"));
}
