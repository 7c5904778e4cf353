//! Orchestration layer for detector sweep campaigns.
//!
//! This module turns a validated config into finished artifacts: it prepares
//! per-variant detector trees, runs the simulation and reconstruction tools
//! through a bounded worker pool with retries, and merges what succeeded.

pub mod aggregator;
pub mod campaign;
pub mod geometry;
pub mod preparer;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod validator;

pub use aggregator::{select_outputs, Aggregator};
pub use campaign::{Campaign, RunSummary};
pub use geometry::{GeometryMutator, XmlConstantMutator};
pub use preparer::VariantPreparer;
pub use retry::{RetryController, RetryDecision, RetryPolicy};
pub use runner::{CommandBuilder, CommandSpec, ProcessRunner, SystemProcessRunner, TaskResult};
pub use scheduler::{Executor, Scheduler, SchedulerEvent};
pub use validator::OutputValidator;
