//! Shared types for the restore pipeline: errors and batch configuration.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::JobState;
use crate::memory::MemoryTiers;
use crate::scheduler::PhasePolicy;
use crate::stage::{Phase, PipelineDefinition};

/// Which of a job's required inputs failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputKind {
    /// Scratch directory shared by all jobs of a batch.
    WorkDir,
    /// Directory that receives the restored page (the destination's parent).
    OutputDir,
    /// The original scanned page.
    SourceFile,
    /// The super-resolution upscaled copy of the source page.
    UpscaylFile,
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkDir => f.write_str("work directory"),
            Self::OutputDir => f.write_str("restored directory"),
            Self::SourceFile => f.write_str("srce file"),
            Self::UpscaylFile => f.write_str("upscayl file"),
        }
    }
}

/// Errors raised by the scheduler and by job setup.
///
/// Stage failures are deliberately *not* represented here: they are
/// absorbed into the job's failure state (see
/// [`StageError`](crate::StageError)) and never propagate out of a
/// phase call.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A job precondition does not hold: a directory or input file is
    /// missing or unusable.
    #[error("{kind} not found: \"{}\"", path.display())]
    InvalidInput {
        /// Which input was rejected.
        kind: InputKind,
        /// The offending path.
        path: PathBuf,
    },

    /// A phase was requested out of order for a job.
    #[error("cannot run {requested} from state {state}")]
    PhaseOrder {
        /// The phase that was requested.
        requested: Phase,
        /// The job's state at the time of the request.
        state: JobState,
    },

    /// The worker pool for a phase could not be created.
    #[error("failed to build worker pool for {phase}: {source}")]
    WorkerPool {
        /// The phase whose pool failed.
        phase: Phase,
        /// Underlying rayon error.
        #[source]
        source: rayon::ThreadPoolBuildError,
    },

    /// Batch configuration is invalid.
    #[error("invalid restore configuration: {0}")]
    InvalidConfig(String),

    /// Filesystem error outside of any stage.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for one batch run.
///
/// Defaults follow the production setup: 4x upscaled inputs, the
/// standard seven-stage definition, phase 2 sized by host memory, and
/// no stage timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Factor by which the upscaled source exceeds the original scan.
    /// The final resize stage divides by this.
    pub scale: u32,

    /// Explicit per-phase worker counts. When `None`, the policy is
    /// derived at run time from total system memory via
    /// [`memory_tiers`](Self::memory_tiers).
    pub phase_workers: Option<PhasePolicy>,

    /// Memory thresholds used to size the smoothing phase when
    /// `phase_workers` is not set.
    pub memory_tiers: MemoryTiers,

    /// Upper bound on a single stage invocation. A stage that exceeds it
    /// is recorded as failed and the job moves on.
    #[serde(with = "crate::diagnostics::duration_serde::option")]
    pub stage_timeout: Option<Duration>,

    /// Which stages run, and in which phase.
    pub definition: PipelineDefinition,
}

impl RestoreConfig {
    /// Default upscale factor.
    pub const DEFAULT_SCALE: u32 = 4;

    /// The worker policy for this run: the explicit one if configured,
    /// otherwise one detected from host memory.
    #[must_use]
    pub fn phase_policy(&self) -> PhasePolicy {
        self.phase_workers
            .unwrap_or_else(|| PhasePolicy::detect(&self.memory_tiers))
    }

    /// Check invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if the scale is zero, a
    /// worker count is zero, the stage timeout is zero, or the pipeline
    /// definition is malformed.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.scale == 0 {
            return Err(PipelineError::InvalidConfig(
                "scale must be at least 1".to_string(),
            ));
        }
        if let Some(policy) = &self.phase_workers {
            policy.validate()?;
        }
        self.memory_tiers.validate()?;
        if self.stage_timeout.is_some_and(|t| t.is_zero()) {
            return Err(PipelineError::InvalidConfig(
                "stage_timeout must be greater than zero".to_string(),
            ));
        }
        self.definition.validate()
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            scale: Self::DEFAULT_SCALE,
            phase_workers: None,
            memory_tiers: MemoryTiers::default(),
            stage_timeout: None,
            definition: PipelineDefinition::default(),
        }
    }
}
