//! Artifact validation.

use std::fs;
use std::path::Path;

/// Size threshold below which an artifact is treated as a failed run.
pub const DEFAULT_MIN_OUTPUT_BYTES: u64 = 1000;

/// Decides whether a tool produced a usable artifact.
///
/// The check is a size heuristic, not a content check: the simulation and
/// reconstruction tools write a file header even when they process no
/// events, and anything below the threshold is that header or less.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputValidator {
    min_bytes: u64,
}

impl OutputValidator {
    pub fn new(min_bytes: u64) -> Self {
        Self { min_bytes }
    }

    pub fn min_bytes(&self) -> u64 {
        self.min_bytes
    }

    /// Returns `(valid, size)`. A missing path or a directory is invalid
    /// with size 0.
    pub fn validate(&self, path: &Path) -> (bool, u64) {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => {
                let size = meta.len();
                (size >= self.min_bytes, size)
            }
            _ => (false, 0),
        }
    }
}

impl Default for OutputValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_OUTPUT_BYTES)
    }
}
