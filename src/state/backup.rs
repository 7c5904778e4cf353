//! Run archives and the human-readable run summary.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::core::naming::RunLayout;
use crate::core::task::TaskStatus;
use crate::error::Result;
use crate::state::manifest::{RunManifest, TaskRecord};
use crate::util::write_atomic;
use crate::{plog, plog_debug};

/// Per-variant subdirectories that are not archived.
const NOT_ARCHIVED: [&str; 2] = ["detector", "work"];

const MANIFEST_FILE: &str = "manifest.json";
const README_FILE: &str = "README.txt";

/// Copies a finished run into a timestamp-keyed archive directory.
pub struct BackupManager {
    layout: RunLayout,
}

impl BackupManager {
    pub fn new(layout: RunLayout) -> Self {
        Self { layout }
    }

    /// Archive the variant directories referenced by `manifest.tasks` into
    /// `timestamped_dir`, plus the merged output, the manifest and a README.
    ///
    /// An existing `timestamped_dir` is never reused: a numeric suffix is
    /// appended until the name is free. Returns the directory written.
    pub fn archive(&self, manifest: &RunManifest, timestamped_dir: &Path) -> Result<PathBuf> {
        let dest = unique_dir(timestamped_dir);
        fs::create_dir_all(&dest)?;
        plog_debug!("Archiving run {} into {}", manifest.run_id, dest.display());

        for variant_key in variant_keys(&manifest.tasks) {
            let src = self.layout.variant_dir(&variant_key);
            if src.is_dir() {
                copy_outputs(&src, &dest.join(RunLayout::variant_dir_name(&variant_key)))?;
            }
        }

        if let Some(merged) = &manifest.merged_output_path {
            if let Some(name) = merged.file_name() {
                if merged.is_file() {
                    fs::copy(merged, dest.join(name))?;
                }
            }
        }

        write_summary(manifest, &dest)?;
        plog!("Run {} archived to {}", manifest.run_id, dest.display());
        Ok(dest)
    }
}

/// Write `manifest.json` and `README.txt` into `dir`.
pub fn write_summary(manifest: &RunManifest, dir: &Path) -> Result<()> {
    manifest.save(&dir.join(MANIFEST_FILE))?;
    write_atomic(&dir.join(README_FILE), render_summary(manifest).as_bytes())
}

fn variant_keys(records: &[TaskRecord]) -> BTreeSet<String> {
    records.iter().map(|r| r.variant_key.clone()).collect()
}

/// First of `base`, `base_1`, `base_2`, ... that does not exist yet.
fn unique_dir(base: &Path) -> PathBuf {
    if !base.exists() {
        return base.to_path_buf();
    }
    let name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    (1..)
        .map(|i| base.with_file_name(format!("{}_{}", name, i)))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| base.to_path_buf())
}

fn copy_outputs(src: &Path, dst: &Path) -> Result<()> {
    let walker = WalkDir::new(src).into_iter().filter_entry(|e| {
        e.depth() != 1 || !NOT_ARCHIVED.contains(&e.file_name().to_string_lossy().as_ref())
    });
    for entry in walker {
        let entry = entry?;
        let Ok(rel) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Plain-text run summary: settings, counts and what went wrong.
pub fn render_summary(manifest: &RunManifest) -> String {
    let cfg = &manifest.config_snapshot;
    let counts = manifest.status_counts();
    let mut out = String::new();

    let _ = writeln!(out, "pixsweep run {}", manifest.run_id);
    let _ = writeln!(out, "Started:  {}", manifest.started_at.to_rfc3339());
    match manifest.finished_at {
        Some(t) => {
            let _ = writeln!(out, "Finished: {}", t.to_rfc3339());
        }
        None => {
            let _ = writeln!(out, "Finished: (unfinished)");
        }
    }

    let _ = writeln!(out, "\nSettings");
    let _ = writeln!(out, "  Particles per job: {}", cfg.particle_count);
    let pixels: Vec<String> = cfg.variants.iter().map(|v| v.key()).collect();
    let _ = writeln!(out, "  Pixel sizes (dx x dy, {}): {}", cfg.geometry.unit, pixels.join(", "));
    let energies: Vec<String> = cfg.energies.iter().map(|e| e.key()).collect();
    let _ = writeln!(out, "  Energies: {}", energies.join(", "));
    let _ = writeln!(
        out,
        "  Detector: {}",
        cfg.detector_source_path.join(&cfg.detector_entry).display()
    );
    if cfg.enable_reconstruction {
        let _ = writeln!(out, "  Reconstruction: enabled ({})", cfg.plugins.join(", "));
    } else {
        let _ = writeln!(out, "  Reconstruction: disabled");
    }
    let _ = writeln!(
        out,
        "  Workers: {}  Max attempts: {}  Serial fallback: {}",
        manifest.workers,
        cfg.max_attempts,
        if cfg.serial_fallback { "yes" } else { "no" }
    );

    let _ = writeln!(out, "\nResults");
    let _ = writeln!(out, "  Success: {}", counts.success);
    let _ = writeln!(out, "  Failed:  {}", counts.failed);
    let _ = writeln!(out, "  Skipped: {}", counts.skipped);
    if counts.unfinished > 0 {
        let _ = writeln!(out, "  Unfinished: {}", counts.unfinished);
    }

    match (&manifest.merged_output_path, &manifest.merge_error) {
        (Some(path), _) => {
            let _ = writeln!(out, "  Merged output: {}", path.display());
        }
        (None, Some(err)) => {
            let _ = writeln!(out, "  Merge failed: {}", err);
        }
        (None, None) => {}
    }

    let failed: Vec<&TaskRecord> = manifest
        .tasks
        .iter()
        .filter(|r| matches!(r.status, TaskStatus::Failed { .. }))
        .collect();
    if !failed.is_empty() {
        let _ = writeln!(out, "\nFailed tasks");
        for r in failed {
            let _ = writeln!(out, "  {} after {} attempts: {}", r.id, r.attempts, r.status);
        }
    }

    if !manifest.skipped_task_ids.is_empty() {
        let _ = writeln!(out, "\nSkipped tasks");
        for id in &manifest.skipped_task_ids {
            let _ = writeln!(out, "  {}", id);
        }
    }

    if !manifest.prepare_errors.is_empty() {
        let _ = writeln!(out, "\nVariant preparation errors");
        for e in &manifest.prepare_errors {
            let _ = writeln!(out, "  {}: {}", e.variant, e.message);
        }
    }

    out
}
