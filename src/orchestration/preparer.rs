//! Per-variant detector trees.
//!
//! The base detector is copied, never edited: each variant gets its own
//! tree under `<run_root>/<variant>px/detector` and overrides are applied
//! to that copy only.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::config::CampaignConfig;
use crate::core::naming::RunLayout;
use crate::core::params::{GeometrySettings, VariantParams};
use crate::error::{Error, Result};
use crate::orchestration::geometry::{GeometryMutator, XmlConstantMutator};
use crate::{plog, plog_debug};

/// Top-level entries of the base tree that are never copied.
const SKIPPED_TOP_LEVEL: [&str; 2] = ["build", ".git"];

pub struct VariantPreparer {
    layout: RunLayout,
    detector_entry: PathBuf,
    geometry: GeometrySettings,
    mutator: Arc<dyn GeometryMutator>,
}

impl VariantPreparer {
    pub fn new(
        layout: RunLayout,
        detector_entry: PathBuf,
        geometry: GeometrySettings,
        mutator: Arc<dyn GeometryMutator>,
    ) -> Self {
        Self {
            layout,
            detector_entry,
            geometry,
            mutator,
        }
    }

    /// Preparer using the XML constant mutator with the configured unit.
    pub fn from_config(cfg: &CampaignConfig, layout: RunLayout) -> Self {
        let mutator = Arc::new(XmlConstantMutator::new(&cfg.geometry.unit));
        Self::new(layout, cfg.detector_entry.clone(), cfg.geometry.clone(), mutator)
    }

    /// Copy `base_detector` for `variant`, apply its overrides and return the
    /// path of the prepared compact file.
    ///
    /// # Errors
    ///
    /// Every failure is reported as [`Error::Prepare`] naming the variant.
    pub fn prepare(&self, variant: &VariantParams, base_detector: &Path) -> Result<PathBuf> {
        let key = variant.key();
        self.prepare_inner(variant, &key, base_detector)
            .map_err(|e| match e {
                Error::Prepare { .. } => e,
                other => Error::prepare(&key, other),
            })
    }

    fn prepare_inner(&self, variant: &VariantParams, key: &str, base: &Path) -> Result<PathBuf> {
        let dest = self.layout.detector_dir(key);
        let base_abs = fs::canonicalize(base)?;
        let dest_abs = resolve_destination(&dest)?;
        if dest_abs.starts_with(&base_abs) {
            return Err(Error::prepare(
                key,
                format!(
                    "destination {} lies inside the base detector {}",
                    dest_abs.display(),
                    base_abs.display()
                ),
            ));
        }

        if dest.exists() {
            plog_debug!("Removing stale detector copy {}", dest.display());
            fs::remove_dir_all(&dest)?;
        }

        let copied = copy_tree(&base_abs, &dest)?;
        plog_debug!(
            "Copied {} entries from {} to {}",
            copied,
            base_abs.display(),
            dest.display()
        );

        self.mutator
            .apply_overrides(&dest, &variant.overrides(&self.geometry))?;

        let entry = dest.join(&self.detector_entry);
        if !entry.is_file() {
            return Err(Error::prepare(
                key,
                format!("prepared tree has no {}", self.detector_entry.display()),
            ));
        }

        plog!("Prepared variant {} at {}", key, dest.display());
        Ok(entry)
    }
}

/// Canonical form of a path that may not exist yet: the deepest existing
/// ancestor is canonicalized and the missing components are appended.
fn resolve_destination(path: &Path) -> Result<PathBuf> {
    let mut existing = path;
    let mut missing = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => break,
        }
    }

    let mut resolved = if existing.as_os_str().is_empty() {
        std::env::current_dir()?
    } else {
        fs::canonicalize(existing)?
    };
    for name in missing.iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

/// Copy `src` into `dst`, skipping [`SKIPPED_TOP_LEVEL`] entries. Symlinks
/// are recreated as symlinks on unix. Returns the number of entries copied.
fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    fs::create_dir_all(dst)?;
    let walker = WalkDir::new(src).follow_links(false).into_iter().filter_entry(|e| {
        if e.depth() != 1 {
            return true;
        }
        let name = e.file_name().to_string_lossy();
        !SKIPPED_TOP_LEVEL.contains(&name.as_ref())
    });

    let mut copied = 0;
    for entry in walker {
        let entry = entry?;
        let Ok(rel) = entry.path().strip_prefix(src) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else if file_type.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        } else {
            continue;
        }
        copied += 1;
    }
    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> Result<()> {
    let points_to = fs::read_link(link)?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    std::os::unix::fs::symlink(points_to, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> Result<()> {
    let real = fs::canonicalize(link)?;
    if real.is_file() {
        fs::copy(real, target)?;
    }
    Ok(())
}
