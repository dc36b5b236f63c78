//! restore-pipeline: phase-barrier batch scheduler for page restoration.
//!
//! Every page of a batch is wrapped in a [`PipelineJob`] that owns the
//! page's artifact paths and failure state. The [`Scheduler`] drives all
//! jobs through four phases:
//!
//! prefilter -> smooth -> trace -> composite
//!
//! Each phase runs as its own bounded worker pool. No job enters phase
//! *k+1* before every job has returned from phase *k*. After the last
//! phase, [`report::check_for_errors`] verifies every expected artifact
//! on disk and produces a [`BatchReport`].
//!
//! The image operations themselves live behind the [`StageEngine`]
//! trait. This crate only schedules, contains failures, and reports.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use restore_pipeline::{batch, BatchEntry, JobSettings, RestoreConfig, Scheduler, StageEngine};
//! # fn run(entries: Vec<BatchEntry>, engine: Arc<dyn StageEngine>) -> Result<(), restore_pipeline::PipelineError> {
//! let config = RestoreConfig::default();
//! let settings = JobSettings::new("/tmp/restore-work", &config, engine);
//! let mut plan = batch::plan(entries, &settings);
//! let scheduler = Scheduler::new(config.phase_policy());
//! let report = batch::run(&mut plan, &scheduler)?;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```

pub mod artifacts;
pub mod batch;
pub mod diagnostics;
pub mod job;
pub mod memory;
pub mod report;
pub mod scheduler;
pub mod stage;
pub mod tool;
pub mod types;

pub use artifacts::ArtifactPaths;
pub use batch::{BatchEntry, BatchPlan, SetupFailure};
pub use diagnostics::{PhaseOutcome, StageOutcome, StageRecord};
pub use job::{FailureKind, JobSettings, JobState, PipelineJob, StageFailure};
pub use memory::MemoryTiers;
pub use report::{BatchReport, JobReport};
pub use scheduler::{PhasePolicy, Scheduler};
pub use stage::{
    Phase, PipelineDefinition, Stage, StageContext, StageDescriptor, StageEngine, StageError,
};
pub use tool::{ToolCommand, ToolError};
pub use types::{InputKind, PipelineError, RestoreConfig};
