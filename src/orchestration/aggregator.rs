//! Merge step: combines the artifacts of successful tasks into one file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::MergeSelection;
use crate::core::task::Task;
use crate::error::{Error, Result};
use crate::orchestration::runner::{CommandBuilder, ProcessRunner, TaskResult};
use crate::orchestration::validator::OutputValidator;
use crate::{plog, plog_debug};

/// Task id recorded on the merge's [`TaskResult`].
pub const MERGE_TASK_ID: &str = "merge";

pub struct Aggregator {
    runner: Arc<dyn ProcessRunner>,
    commands: Arc<CommandBuilder>,
    validator: OutputValidator,
}

impl Aggregator {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        commands: Arc<CommandBuilder>,
        validator: OutputValidator,
    ) -> Self {
        Self {
            runner,
            commands,
            validator,
        }
    }

    /// Run the merge tool over `valid_outputs`, writing `merged_path`.
    ///
    /// # Errors
    ///
    /// `Error::Merge` when there is nothing to merge, the tool cannot be
    /// started or exits non-zero, or the merged file fails validation.
    pub fn merge(&self, valid_outputs: &[PathBuf], merged_path: &Path) -> Result<TaskResult> {
        if valid_outputs.is_empty() {
            return Err(Error::Merge("no successful outputs to merge".to_string()));
        }

        match fs::remove_file(merged_path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        let work_dir = merged_path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(work_dir)?;
        let log_path = work_dir.join("merge.log");

        let cmd = self.commands.merge(merged_path, valid_outputs);
        plog!("Merging {} output(s) into {}", valid_outputs.len(), merged_path.display());
        plog_debug!("Merge command: {}", cmd);

        let mut result = self
            .runner
            .run(&cmd, work_dir, &log_path)
            .map_err(|e| Error::Merge(format!("could not start merge tool: {}", e)))?
            .attach(MERGE_TASK_ID, 1);

        if !result.exited_ok() {
            let reason = result
                .error
                .clone()
                .unwrap_or_else(|| "merge tool failed".to_string());
            return Err(Error::Merge(reason));
        }

        let (valid, size) = self.validator.validate(merged_path);
        result.output_size_bytes = size;
        result.valid = valid;
        if !valid {
            return Err(Error::Merge(format!(
                "merged file {} is {} bytes, below the {} byte threshold",
                merged_path.display(),
                size,
                self.validator.min_bytes()
            )));
        }
        Ok(result)
    }
}

/// Outputs of the tasks that reached `Success`, filtered by `selection`,
/// in task order.
pub fn select_outputs(tasks: &[Task], selection: MergeSelection) -> Vec<PathBuf> {
    tasks
        .iter()
        .filter(|t| t.is_success() && selection.includes(t.kind))
        .map(|t| t.output_path.clone())
        .collect()
}
