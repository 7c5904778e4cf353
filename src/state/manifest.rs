//! Run manifest: the durable record of one campaign run.
//!
//! The manifest is written as soon as the run starts and rewritten after
//! every change, so an interrupted run still leaves a readable record of
//! every attempt made so far.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::config::CampaignConfig;
use crate::core::naming::RunId;
use crate::core::task::{Task, TaskId, TaskKind, TaskStatus};
use crate::orchestration::runner::TaskResult;
use crate::util::write_atomic;
use crate::{plog_debug, Error, Result};

pub const MANIFEST_VERSION: u32 = 1;

/// Final state of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub kind: TaskKind,
    pub variant_key: String,
    pub energy_key: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub output_path: PathBuf,
    pub log_path: PathBuf,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Task> for TaskRecord {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            kind: task.kind,
            variant_key: task.variant_key.clone(),
            energy_key: task.energy.key(),
            status: task.status.clone(),
            attempts: task.attempt,
            output_path: task.output_path.clone(),
            log_path: task.log_path.clone(),
            started_at: task.started_at,
            completed_at: task.completed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareFailure {
    pub variant: String,
    pub message: String,
}

/// Outcome of the aggregation step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeRecord {
    pub merged_output_path: Option<PathBuf>,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
}

/// Per-status task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Pending or Running; non-zero only in an unfinished manifest.
    pub unfinished: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub version: u32,
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub config_snapshot: CampaignConfig,
    /// Worker slots the scheduler actually used.
    #[serde(default)]
    pub workers: usize,
    /// Every attempt of every task, in completion order.
    pub task_results: Vec<TaskResult>,
    pub tasks: Vec<TaskRecord>,
    pub prepare_errors: Vec<PrepareFailure>,
    pub merged_output_path: Option<PathBuf>,
    pub merge_result: Option<TaskResult>,
    pub merge_error: Option<String>,
    pub failed_task_ids: Vec<TaskId>,
    pub skipped_task_ids: Vec<TaskId>,
}

impl RunManifest {
    pub fn new(run_id: RunId, config: CampaignConfig, workers: usize) -> Self {
        Self {
            version: MANIFEST_VERSION,
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            config_snapshot: config,
            workers,
            task_results: Vec::new(),
            tasks: Vec::new(),
            prepare_errors: Vec::new(),
            merged_output_path: None,
            merge_result: None,
            merge_error: None,
            failed_task_ids: Vec::new(),
            skipped_task_ids: Vec::new(),
        }
    }

    /// Read a manifest written by this or an older version.
    pub fn load(path: &Path) -> Result<Self> {
        let manifest: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        if manifest.version > MANIFEST_VERSION {
            return Err(Error::Validation(format!(
                "manifest {} has version {}, newer than supported {}",
                path.display(),
                manifest.version,
                MANIFEST_VERSION
            )));
        }
        Ok(manifest)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, serde_json::to_string_pretty(self)?.as_bytes())
    }

    pub fn is_finalized(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn status_counts(&self) -> StatusCounts {
        self.tasks
            .iter()
            .fold(StatusCounts::default(), |mut counts, record| {
                match record.status {
                    TaskStatus::Success => counts.success += 1,
                    TaskStatus::Failed { .. } => counts.failed += 1,
                    TaskStatus::Skipped { .. } => counts.skipped += 1,
                    TaskStatus::Pending | TaskStatus::Running => counts.unfinished += 1,
                }
                counts
            })
    }

    /// Replace the records of `changed` tasks in place, appending any
    /// that are not listed yet.
    fn upsert_tasks(&mut self, changed: &[Task]) {
        for task in changed {
            let record = TaskRecord::from(task);
            match self.tasks.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => *existing = record,
                None => self.tasks.push(record),
            }
        }
    }

    /// All attempts recorded for one task.
    pub fn attempts_of(&self, id: &TaskId) -> Vec<&TaskResult> {
        self.task_results
            .iter()
            .filter(|r| r.task_id == id.as_str())
            .collect()
    }
}

/// Mutex-guarded owner of the run manifest. Every mutation is persisted
/// before the call returns.
#[derive(Debug)]
pub struct ManifestWriter {
    path: PathBuf,
    manifest: Mutex<RunManifest>,
}

impl ManifestWriter {
    /// Write the initial manifest to `path` and take ownership of it.
    pub fn create(path: PathBuf, manifest: RunManifest) -> Result<Self> {
        manifest.save(&path)?;
        plog_debug!("Manifest created at {}", path.display());
        Ok(Self {
            path,
            manifest: Mutex::new(manifest),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, RunManifest> {
        self.manifest.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update(&self, f: impl FnOnce(&mut RunManifest)) -> Result<()> {
        let mut manifest = self.lock();
        f(&mut manifest);
        manifest.save(&self.path)
    }

    /// Append one finished attempt and refresh the tasks it changed,
    /// in a single write.
    pub fn record_attempt(&self, result: TaskResult, changed: &[Task]) -> Result<()> {
        self.update(|m| {
            m.task_results.push(result);
            m.upsert_tasks(changed);
        })
    }

    /// Replace the task table with the current task states.
    pub fn record_tasks(&self, tasks: &[Task]) -> Result<()> {
        let records = tasks.iter().map(TaskRecord::from).collect();
        self.update(|m| m.tasks = records)
    }

    /// Refresh the records of `changed` tasks only.
    pub fn update_tasks(&self, changed: &[Task]) -> Result<()> {
        self.update(|m| m.upsert_tasks(changed))
    }

    pub fn record_prepare_error(&self, variant: &str, message: &str) -> Result<()> {
        self.update(|m| {
            m.prepare_errors.push(PrepareFailure {
                variant: variant.to_string(),
                message: message.to_string(),
            })
        })
    }

    /// Record final task states and the merge outcome, and stamp the
    /// finish time. Returns the finished manifest.
    pub fn finalize(&self, tasks: &[Task], merge: MergeRecord) -> Result<RunManifest> {
        let mut manifest = self.lock();
        manifest.tasks = tasks.iter().map(TaskRecord::from).collect();
        manifest.failed_task_ids = ids_where(tasks, |s| matches!(s, TaskStatus::Failed { .. }));
        manifest.skipped_task_ids = ids_where(tasks, |s| matches!(s, TaskStatus::Skipped { .. }));
        manifest.merged_output_path = merge.merged_output_path;
        manifest.merge_result = merge.result;
        manifest.merge_error = merge.error;
        manifest.finished_at = Some(Utc::now());
        manifest.save(&self.path)?;
        plog_debug!(
            "Manifest finalized: {} tasks, {} failed, {} skipped",
            manifest.tasks.len(),
            manifest.failed_task_ids.len(),
            manifest.skipped_task_ids.len()
        );
        Ok(manifest.clone())
    }

    pub fn snapshot(&self) -> RunManifest {
        self.lock().clone()
    }
}

fn ids_where(tasks: &[Task], pred: impl Fn(&TaskStatus) -> bool) -> Vec<TaskId> {
    tasks
        .iter()
        .filter(|t| pred(&t.status))
        .map(|t| t.id.clone())
        .collect()
}
