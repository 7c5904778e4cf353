//! Campaign: one end-to-end run of the sweep.
//!
//! Wires the stages together in order: expand, prepare each variant,
//! schedule, merge, finalize the manifest and archive. Only failures to
//! write the run's own records are returned as errors. Task, preparation
//! and merge failures are recorded in the manifest instead.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::config::CampaignConfig;
use crate::core::dag::TaskDAG;
use crate::core::expand::expand;
use crate::core::naming::{RunId, RunLayout};
use crate::core::task::{Task, TaskId, TaskKind};
use crate::error::{Error, Result};
use crate::orchestration::aggregator::{select_outputs, Aggregator};
use crate::orchestration::geometry::GeometryMutator;
use crate::orchestration::preparer::VariantPreparer;
use crate::orchestration::retry::{RetryController, RetryPolicy};
use crate::orchestration::runner::{CommandBuilder, ProcessRunner};
use crate::orchestration::scheduler::{Executor, Scheduler, SchedulerEvent};
use crate::orchestration::validator::OutputValidator;
use crate::state::backup::{write_summary, BackupManager};
use crate::state::manifest::{ManifestWriter, MergeRecord, RunManifest, StatusCounts};
use crate::util::blocking;
use crate::{plog, plog_error, plog_trace, plog_warn};

const EVENT_BUFFER: usize = 256;

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: RunId,
    pub run_root: PathBuf,
    pub counts: StatusCounts,
    pub failed_task_ids: Vec<TaskId>,
    pub skipped_task_ids: Vec<TaskId>,
    pub merged_output_path: Option<PathBuf>,
    pub merge_error: Option<String>,
    pub archive_dir: PathBuf,
}

impl RunSummary {
    fn from_manifest(manifest: &RunManifest, run_root: PathBuf, archive_dir: PathBuf) -> Self {
        Self {
            run_id: manifest.run_id.clone(),
            run_root,
            counts: manifest.status_counts(),
            failed_task_ids: manifest.failed_task_ids.clone(),
            skipped_task_ids: manifest.skipped_task_ids.clone(),
            merged_output_path: manifest.merged_output_path.clone(),
            merge_error: manifest.merge_error.clone(),
            archive_dir,
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} finished", self.run_id)?;
        writeln!(
            f,
            "  success: {}  failed: {}  skipped: {}",
            self.counts.success, self.counts.failed, self.counts.skipped
        )?;
        for id in &self.failed_task_ids {
            writeln!(f, "  failed: {}", id)?;
        }
        match (&self.merged_output_path, &self.merge_error) {
            (Some(path), _) => writeln!(f, "  merged: {}", path.display())?,
            (None, Some(err)) => writeln!(f, "  merge failed: {}", err)?,
            (None, None) => {}
        }
        write!(f, "  record: {}", self.archive_dir.display())
    }
}

pub struct Campaign {
    cfg: Arc<CampaignConfig>,
    runner: Arc<dyn ProcessRunner>,
    mutator: Option<Arc<dyn GeometryMutator>>,
    run_id: Option<RunId>,
    events: Option<mpsc::Sender<SchedulerEvent>>,
}

impl Campaign {
    pub fn new(cfg: CampaignConfig, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            cfg: Arc::new(cfg),
            runner,
            mutator: None,
            run_id: None,
            events: None,
        }
    }

    /// Replace the default XML constant mutator.
    pub fn with_mutator(mut self, mutator: Arc<dyn GeometryMutator>) -> Self {
        self.mutator = Some(mutator);
        self
    }

    /// Use a fixed run id instead of the current timestamp.
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Forward scheduler events to `tx`. The receiver must be drained or
    /// the scheduler stalls once the channel is full.
    pub fn with_events(mut self, tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &CampaignConfig {
        &self.cfg
    }

    pub async fn run(self) -> Result<RunSummary> {
        let cfg = Arc::clone(&self.cfg);
        let requested = self.run_id.clone().unwrap_or_else(RunId::now);
        let layout = blocking({
            let output_root = cfg.output_root.clone();
            move || RunLayout::claim(&output_root, requested)
        })
        .await?;
        let run_id = layout.run_id().clone();
        plog!("Run {} starting in {}", run_id, layout.run_root().display());

        let workers = cfg.effective_workers();
        let dag = TaskDAG::from_tasks(expand(&cfg, &layout))?;
        let manifest = Arc::new(ManifestWriter::create(
            layout.manifest_path(),
            RunManifest::new(run_id.clone(), (*cfg).clone(), workers),
        )?);
        manifest.record_tasks(&dag.snapshot())?;
        let dag = Arc::new(RwLock::new(dag));

        let commands = Arc::new(self.prepare_variants(&layout, &dag, &manifest).await);
        let validator = OutputValidator::new(cfg.min_output_bytes);

        let tasks = {
            let executor = Executor::new(Arc::clone(&self.runner), Arc::clone(&commands), validator);
            let retry = RetryController::new(RetryPolicy {
                max_attempts: cfg.max_attempts,
                serial_fallback: cfg.serial_fallback,
            });
            let event_tx = self.event_sender();
            let mut scheduler = Scheduler::new(
                Arc::clone(&dag),
                executor,
                retry,
                Arc::clone(&manifest),
                workers,
                event_tx,
            );
            plog!(
                "Scheduling {} task(s) on {} worker(s)",
                dag.read().await.task_count(),
                scheduler.workers()
            );
            scheduler.run().await?
        };

        let merge = {
            let outputs = select_outputs(&tasks, cfg.merge_selection);
            let merged_path = layout.merged_output_path();
            let aggregator = Aggregator::new(Arc::clone(&self.runner), commands, validator);
            let target = merged_path.clone();
            match blocking(move || aggregator.merge(&outputs, &target)).await {
                Ok(result) => MergeRecord {
                    merged_output_path: Some(merged_path),
                    result: Some(result),
                    error: None,
                },
                Err(e) => {
                    plog_error!("{}", e);
                    let message = match e {
                        Error::Merge(reason) => reason,
                        other => other.to_string(),
                    };
                    MergeRecord {
                        error: Some(message),
                        ..MergeRecord::default()
                    }
                }
            }
        };

        let finished = manifest.finalize(&tasks, merge)?;
        let archive_dir = self.archive(&layout, &finished).await?;
        Ok(RunSummary::from_manifest(
            &finished,
            layout.run_root().to_path_buf(),
            archive_dir,
        ))
    }

    /// Prepare every variant's detector tree. A variant that fails is
    /// recorded and its tasks are skipped; the others still run.
    async fn prepare_variants(
        &self,
        layout: &RunLayout,
        dag: &Arc<RwLock<TaskDAG>>,
        manifest: &Arc<ManifestWriter>,
    ) -> CommandBuilder {
        let preparer = Arc::new(match &self.mutator {
            Some(m) => VariantPreparer::new(
                layout.clone(),
                self.cfg.detector_entry.clone(),
                self.cfg.geometry.clone(),
                Arc::clone(m),
            ),
            None => VariantPreparer::from_config(&self.cfg, layout.clone()),
        });
        let mut commands = CommandBuilder::new(Arc::clone(&self.cfg));

        for variant in self.cfg.variants.iter().copied() {
            let key = variant.key();
            let p = Arc::clone(&preparer);
            let base = self.cfg.detector_source_path.clone();

            match blocking(move || p.prepare(&variant, &base)).await {
                Ok(compact) => commands.register_variant(&key, compact),
                Err(e) => {
                    plog_error!("{}", e);
                    let reason = format!("variant {} could not be prepared", key);
                    let changed: Vec<Task> = {
                        let mut dag = dag.write().await;
                        let sims: Vec<TaskId> = dag
                            .all_tasks()
                            .into_iter()
                            .filter(|t| t.variant_key == key && t.kind == TaskKind::Simulate)
                            .map(|t| t.id.clone())
                            .collect();
                        let mut changed = Vec::new();
                        for id in sims {
                            if let Ok(skipped) = dag.skip_task(&id, &reason) {
                                plog_warn!("Skipped {} task(s) starting at {}", skipped.len(), id);
                                changed.extend(skipped.iter().filter_map(|s| dag.get_task(s).cloned()));
                            }
                        }
                        changed
                    };

                    let m = Arc::clone(manifest);
                    let (variant, message) = (key.clone(), e.to_string());
                    let written = blocking(move || {
                        m.record_prepare_error(&variant, &message)?;
                        m.update_tasks(&changed)
                    })
                    .await;
                    if let Err(write_err) = written {
                        plog_warn!("Failed to record prepare failure of {}: {}", key, write_err);
                    }
                }
            }
        }
        commands
    }

    fn event_sender(&self) -> mpsc::Sender<SchedulerEvent> {
        if let Some(tx) = &self.events {
            return tx.clone();
        }
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                plog_trace!("event: {:?}", event);
            }
        });
        tx
    }

    async fn archive(&self, layout: &RunLayout, manifest: &RunManifest) -> Result<PathBuf> {
        let manifest = manifest.clone();
        match &self.cfg.backup_root {
            Some(root) => {
                let dest = root.join(layout.run_id().as_str());
                let manager = BackupManager::new(layout.clone());
                blocking(move || manager.archive(&manifest, &dest)).await
            }
            None => {
                let run_root = layout.run_root().to_path_buf();
                let dir = run_root.clone();
                blocking(move || write_summary(&manifest, &dir)).await?;
                plog!("Run summary written to {}", run_root.display());
                Ok(run_root)
            }
        }
    }
}
