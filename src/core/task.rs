//! Task data model for the execution DAG.
//!
//! Tasks are the atomic units of campaign work: one external simulation
//! or one dependent reconstruction. Each task tracks its status, attempt
//! count, artifact paths and timing.

use crate::core::params::EnergySpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which external tool a task drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Simulate,
    Reconstruct,
}

impl TaskKind {
    /// Short form used in task ids and log names.
    pub fn prefix(&self) -> &'static str {
        match self {
            TaskKind::Simulate => "sim",
            TaskKind::Reconstruct => "recon",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Simulate => write!(f, "simulate"),
            TaskKind::Reconstruct => write!(f, "reconstruct"),
        }
    }
}

/// Identifier for a task within a run.
///
/// Deterministic: `<sim|recon>/<variant key>/<energy key>`, so the same
/// configuration always yields the same ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn for_chain(kind: TaskKind, variant_key: &str, energy_key: &str) -> Self {
        Self(format!("{}/{}/{}", kind.prefix(), variant_key, energy_key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("sim" | "recon"), Some(v), Some(e)) if !v.is_empty() && !e.is_empty() => {
                Ok(Self(s.to_string()))
            }
            _ => Err(format!("invalid task id: {}", s)),
        }
    }
}

/// Task status in its lifecycle.
///
/// `Pending → Running → {Success, Failed}`; a failed task goes back to
/// `Pending` while it has attempts left. `Skipped` tasks never ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting for a worker slot (and, for reconstruction, its simulation).
    Pending,
    /// The external tool is running.
    Running,
    /// The tool exited 0 and the artifact passed validation.
    Success,
    /// The last attempt failed.
    Failed {
        /// Why the last attempt was rejected.
        error: String,
    },
    /// Never attempted: its dependency or its variant failed.
    Skipped {
        /// What caused the skip.
        reason: String,
    },
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Skipped { reason } => write!(f, "skipped: {}", reason),
        }
    }
}

/// A single task in the execution DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub variant_key: String,
    pub energy: EnergySpec,
    /// Generator file for simulation, simulation artifact for reconstruction.
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub log_path: PathBuf,
    /// Working directory of the external tool, exclusive to this task.
    pub work_dir: PathBuf,
    /// The simulation a reconstruction waits for. `None` for simulations.
    pub depends_on: Option<TaskId>,
    /// Attempts started so far.
    pub attempt: u32,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task with no attempts.
    pub fn new(
        kind: TaskKind,
        variant_key: &str,
        energy: &EnergySpec,
        input_path: PathBuf,
        output_path: PathBuf,
        log_path: PathBuf,
    ) -> Self {
        let work_dir = output_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            id: TaskId::for_chain(kind, variant_key, &energy.key()),
            kind,
            variant_key: variant_key.to_string(),
            energy: energy.clone(),
            input_path,
            output_path,
            log_path,
            work_dir,
            depends_on: None,
            attempt: 0,
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
        }
    }

    /// Builder-style dependency on another task.
    pub fn depending_on(mut self, id: TaskId) -> Self {
        self.depends_on = Some(id);
        self
    }

    /// Builder-style working directory.
    pub fn in_work_dir(mut self, dir: PathBuf) -> Self {
        self.work_dir = dir;
        self
    }

    /// Start a new attempt.
    ///
    /// Transitions status to Running, bumps the attempt counter and records
    /// the start time.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.attempt += 1;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
    }

    /// Mark the current attempt as successful.
    pub fn succeed(&mut self) {
        self.status = TaskStatus::Success;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the current attempt as failed.
    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed {
            error: error.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    /// Put a failed task back in line for another attempt.
    pub fn requeue(&mut self) {
        self.status = TaskStatus::Pending;
    }

    /// Mark the task as never run.
    pub fn skip(&mut self, reason: &str) {
        self.status = TaskStatus::Skipped {
            reason: reason.to_string(),
        };
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }

    /// Check if the task can be dispatched (status only; dependencies are
    /// the DAG's concern).
    pub fn can_start(&self) -> bool {
        self.status == TaskStatus::Pending
    }

    /// Check if the task ended in Success, Failed or Skipped.
    pub fn is_settled(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Success | TaskStatus::Failed { .. } | TaskStatus::Skipped { .. }
        )
    }
}
