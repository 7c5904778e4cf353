//! Durable run records.
//!
//! The manifest is the authoritative record of a run; archives and the
//! README summary are derived from it.

pub mod backup;
pub mod manifest;

pub use backup::{render_summary, write_summary, BackupManager};
pub use manifest::{
    ManifestWriter, MergeRecord, PrepareFailure, RunManifest, StatusCounts, TaskRecord,
    MANIFEST_VERSION,
};
