//! Scheduler for parallel task execution.
//!
//! The Scheduler drives the DAG to completion: it dispatches ready tasks to
//! a bounded pool of blocking worker threads, validates each attempt's
//! artifact, applies the retry policy, and skips the dependents of tasks
//! that fail for good. Tasks deferred by the retry policy run one at a time
//! once the pool has drained.

use std::fs;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinSet;

use crate::core::dag::TaskDAG;
use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::retry::{RetryController, RetryDecision};
use crate::orchestration::runner::{CommandBuilder, ProcessRunner, TaskResult};
use crate::orchestration::validator::OutputValidator;
use crate::state::manifest::ManifestWriter;
use crate::util::blocking;
use crate::{plog, plog_debug, plog_error, plog_warn};

/// Events emitted by the scheduler for task lifecycle changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A task holds a worker slot and its attempt has begun.
    TaskStarted { task_id: TaskId, attempt: u32 },
    /// A task's artifact passed validation.
    TaskSucceeded { task_id: TaskId, output_size_bytes: u64 },
    /// An attempt failed and the task went back into the pool.
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        error: String,
    },
    /// Pool attempts are exhausted; the task waits for its serial attempt.
    TaskDeferred { task_id: TaskId, error: String },
    /// The task failed for good.
    TaskFailed { task_id: TaskId, error: String },
    /// The task will never run.
    TaskSkipped { task_id: TaskId, reason: String },
    /// Every task reached Success, Failed or Skipped.
    AllTasksComplete,
}

/// Everything a worker thread needs to run one attempt.
#[derive(Clone)]
pub struct Executor {
    runner: Arc<dyn ProcessRunner>,
    commands: Arc<CommandBuilder>,
    validator: OutputValidator,
}

impl Executor {
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

    /// Run one attempt of `task` to completion and validate its artifact.
    ///
    /// Never fails: spawn and I/O problems become an invalid result so the
    /// retry policy sees them like any other failed attempt.
    pub fn execute(&self, task: &Task) -> TaskResult {
        let result = self
            .prepare_paths(task)
            .and_then(|_| self.commands.for_task(task))
            .and_then(|cmd| self.runner.run(&cmd, &task.work_dir, &task.log_path));

        let mut result = match result {
            Ok(r) => r,
            Err(e) => TaskResult::not_started(e),
        };

        let (valid_artifact, size) = self.validator.validate(&task.output_path);
        result.output_size_bytes = size;
        result.valid = result.exited_ok() && valid_artifact;
        if result.error.is_none() && !valid_artifact {
            result.error = Some(format!(
                "output {} is {} bytes, below the {} byte threshold",
                task.output_path.display(),
                size,
                self.validator.min_bytes()
            ));
        }
        result.attach(task.id.as_str(), task.attempt)
    }

    /// Remove any artifact left by an earlier attempt and create the
    /// directories the tool writes into.
    fn prepare_paths(&self, task: &Task) -> Result<()> {
        match fs::remove_file(&task.output_path) {
            Ok(()) => plog_debug!("Removed stale {}", task.output_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = task.output_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir_all(&task.work_dir)?;
        Ok(())
    }
}

/// Scheduler for parallel task execution.
///
/// # Example
///
/// ```ignore
/// let dag = Arc::new(RwLock::new(TaskDAG::from_tasks(tasks)?));
/// let (event_tx, mut event_rx) = mpsc::channel(100);
/// let mut scheduler = Scheduler::new(dag, executor, retry, manifest, 4, event_tx);
/// let tasks = scheduler.run().await?;
/// ```
pub struct Scheduler {
    /// The task dependency graph.
    dag: Arc<RwLock<TaskDAG>>,
    executor: Executor,
    retry: RetryController,
    manifest: Arc<ManifestWriter>,
    /// Worker slots; one permit per running task.
    permits: Arc<Semaphore>,
    workers: usize,
    /// Channel for emitting scheduler events.
    event_tx: mpsc::Sender<SchedulerEvent>,
}

impl Scheduler {
    pub fn new(
        dag: Arc<RwLock<TaskDAG>>,
        executor: Executor,
        retry: RetryController,
        manifest: Arc<ManifestWriter>,
        workers: usize,
        event_tx: mpsc::Sender<SchedulerEvent>,
    ) -> Self {
        let workers = workers.max(1);
        Self {
            dag,
            executor,
            retry,
            manifest,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            event_tx,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Number of tasks holding a worker slot right now.
    pub fn active_count(&self) -> usize {
        self.workers - self.permits.available_permits()
    }

    async fn emit(&self, event: SchedulerEvent) {
        let _ = self.event_tx.send(event).await;
    }

    /// Write changed task states, plus the attempt that changed them, to the
    /// manifest on a blocking thread. A failed write is logged, not fatal.
    async fn persist(&self, result: Option<TaskResult>, changed: Vec<Task>) {
        let manifest = Arc::clone(&self.manifest);
        let written = blocking(move || match result {
            Some(result) => manifest.record_attempt(result, &changed),
            None => manifest.update_tasks(&changed),
        })
        .await;
        if let Err(e) = written {
            plog_warn!("Failed to update manifest: {}", e);
        }
    }

    /// Run until every task is settled and return the final task states in
    /// expansion order.
    ///
    /// Alternates between draining the worker pool and running deferred
    /// tasks serially, since a serial success can unlock new pool work.
    pub async fn run(&mut self) -> Result<Vec<Task>> {
        loop {
            self.drain_pool().await?;
            if !self.retry.has_deferred() {
                break;
            }
            self.run_serial_phase().await?;
        }

        let tasks = self.dag.read().await.snapshot();
        self.emit(SchedulerEvent::AllTasksComplete).await;
        Ok(tasks)
    }

    /// Dispatch ready tasks until no task is ready and none is running.
    async fn drain_pool(&mut self) -> Result<()> {
        let mut running: JoinSet<(TaskId, TaskResult)> = JoinSet::new();
        loop {
            let dispatched = self.dispatch_ready(&mut running).await?;
            if dispatched > 0 {
                plog_debug!(
                    "Dispatched {} task(s), {} active",
                    dispatched,
                    self.active_count()
                );
            }

            match running.join_next().await {
                None => return Ok(()),
                Some(Ok((id, result))) => self.handle_result(&id, result).await?,
                Some(Err(e)) => return Err(Error::TaskJoin(e.to_string())),
            }
        }
    }

    /// Start as many ready tasks as there are free worker slots.
    ///
    /// Returns the number of tasks dispatched.
    pub async fn dispatch_ready(
        &mut self,
        running: &mut JoinSet<(TaskId, TaskResult)>,
    ) -> Result<usize> {
        let ready = self.dag.read().await.ready_tasks();
        let mut dispatched = 0;

        for id in ready {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                break;
            };

            let task = {
                let mut dag = self.dag.write().await;
                let task = dag.task_mut(&id)?;
                task.start();
                task.clone()
            };
            self.persist(None, vec![task.clone()]).await;

            self.emit(SchedulerEvent::TaskStarted {
                task_id: id.clone(),
                attempt: task.attempt,
            })
            .await;
            plog!("Starting {} (attempt {})", id, task.attempt);

            let executor = self.executor.clone();
            running.spawn(run_attempt(executor, task, permit));
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Run every deferred task alone, in the order it was deferred.
    async fn run_serial_phase(&mut self) -> Result<()> {
        plog!(
            "Serial retry of {} task(s) after the pool drained",
            self.retry.deferred_count()
        );
        while let Some(id) = self.retry.next_deferred() {
            let permit = Arc::clone(&self.permits)
                .acquire_many_owned(self.workers as u32)
                .await
                .map_err(|e| Error::TaskJoin(e.to_string()))?;

            let task = {
                let mut dag = self.dag.write().await;
                let task = dag.task_mut(&id)?;
                task.requeue();
                task.start();
                task.clone()
            };
            self.persist(None, vec![task.clone()]).await;
            self.emit(SchedulerEvent::TaskStarted {
                task_id: id.clone(),
                attempt: task.attempt,
            })
            .await;
            plog!("Serial retry of {} (attempt {})", id, task.attempt);

            let (id, result) = run_attempt(self.executor.clone(), task, permit).await;
            self.handle_result(&id, result).await?;
        }
        Ok(())
    }

    /// Apply one finished attempt to the DAG and record it, with every
    /// task state it changed, in the manifest.
    pub async fn handle_result(&mut self, id: &TaskId, result: TaskResult) -> Result<()> {
        let mut events = Vec::new();
        let mut changed = vec![id.clone()];
        let changed_tasks: Vec<Task> = {
            let mut dag = self.dag.write().await;
            let task = dag.task_mut(id)?;

            if result.valid {
                task.succeed();
                plog!(
                    "{} succeeded ({} bytes, {} ms)",
                    id,
                    result.output_size_bytes,
                    result.duration_ms
                );
                events.push(SchedulerEvent::TaskSucceeded {
                    task_id: id.clone(),
                    output_size_bytes: result.output_size_bytes,
                });
            } else {
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "attempt failed".to_string());
                task.fail(&error);

                match self.retry.on_failure(task) {
                    RetryDecision::Requeue => {
                        task.requeue();
                        plog_warn!("{} attempt {} failed, requeued: {}", id, task.attempt, error);
                        events.push(SchedulerEvent::TaskRetrying {
                            task_id: id.clone(),
                            attempt: task.attempt,
                            error,
                        });
                    }
                    RetryDecision::SerialFallback => {
                        plog_warn!("{} deferred to serial retry: {}", id, error);
                        events.push(SchedulerEvent::TaskDeferred {
                            task_id: id.clone(),
                            error,
                        });
                    }
                    RetryDecision::GiveUp => {
                        plog_error!("{} failed after {} attempts: {}", id, task.attempt, error);
                        events.push(SchedulerEvent::TaskFailed {
                            task_id: id.clone(),
                            error,
                        });
                        let reason = format!("dependency {} failed", id);
                        for skipped in dag.skip_dependents(id, &reason) {
                            plog_warn!("Skipping {}: {}", skipped, reason);
                            changed.push(skipped.clone());
                            events.push(SchedulerEvent::TaskSkipped {
                                task_id: skipped,
                                reason: reason.clone(),
                            });
                        }
                    }
                }
            }

            changed
                .iter()
                .filter_map(|c| dag.get_task(c).cloned())
                .collect()
        };
        self.persist(Some(result), changed_tasks).await;

        for event in events {
            self.emit(event).await;
        }
        Ok(())
    }
}

/// One attempt on a blocking thread. The permit is held until the
/// subprocess has exited.
async fn run_attempt(
    executor: Executor,
    task: Task,
    permit: OwnedSemaphorePermit,
) -> (TaskId, TaskResult) {
    let id = task.id.clone();
    let attempt = task.attempt;
    let result = blocking(move || Ok(executor.execute(&task)))
        .await
        .unwrap_or_else(|e| TaskResult::not_started(e).attach(id.as_str(), attempt));
    drop(permit);
    (id, result)
}
