//! Core domain models for campaign orchestration.
//!
//! Sweep parameters, on-disk naming, tasks, the execution DAG and the
//! expansion from config to tasks.

pub mod dag;
pub mod expand;
pub mod naming;
pub mod params;
pub mod task;

pub use dag::TaskDAG;
pub use expand::expand;
pub use naming::{ArtifactName, RunId, RunLayout};
pub use params::{EnergySpec, GeometrySettings, VariantParams};
pub use task::{Task, TaskId, TaskKind, TaskStatus};
