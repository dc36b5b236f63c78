//! One page's restore pipeline: artifact paths, phase calls, and
//! failure state.
//!
//! A [`PipelineJob`] moves through
//! `Constructed -> PhaseDone(Prefilter) -> PhaseDone(Smooth) ->
//! PhaseDone(Trace) -> PhaseDone(Composite)`, one
//! [`run_phase`](PipelineJob::run_phase) call per transition. Failure is
//! tracked separately from state: a stage error marks the job failed
//! but never stops it. Later stages and phases still run so the job
//! leaves behind as much partial output as possible for diagnosis.
//!
//! ```rust,no_run
//! # use restore_pipeline::{PipelineJob, Phase, PipelineError};
//! # fn drive(job: &mut PipelineJob) -> Result<(), PipelineError> {
//! for phase in Phase::ALL {
//!     let outcome = job.run_phase(phase)?;
//!     for (stage, reason) in outcome.failures() {
//!         eprintln!("{stage} failed: {reason}");
//!     }
//! }
//! assert!(!job.failed() || !job.failures().is_empty());
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::artifacts::ArtifactPaths;
use crate::batch::BatchEntry;
use crate::diagnostics::{PhaseOutcome, StageOutcome, StageRecord};
use crate::stage::{Phase, PipelineDefinition, Stage, StageContext, StageEngine, StageError};
use crate::types::{InputKind, PipelineError, RestoreConfig};

// ──────────────────────────── State & failures ───────────────────────

/// Where a job is in its phase sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Built and validated; no phase has run.
    Constructed,
    /// The given phase (and all before it) has returned.
    PhaseDone(Phase),
}

impl JobState {
    /// The phase allowed to run next, or `None` once all are done.
    #[must_use]
    pub const fn next_phase(self) -> Option<Phase> {
        match self {
            Self::Constructed => Some(Phase::Prefilter),
            Self::PhaseDone(phase) => phase.next(),
        }
    }

    /// Whether every phase has run.
    #[must_use]
    pub const fn is_complete(self) -> bool {
        self.next_phase().is_none()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constructed => f.write_str("constructed"),
            Self::PhaseDone(phase) => write!(f, "{phase} done"),
        }
    }
}

/// How a failure was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The stage call returned an error, panicked, or timed out.
    Stage,
    /// The stage's expected artifact was absent after the batch ran.
    MissingArtifact,
}

/// A recorded failure of one stage of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    /// The stage that failed.
    pub stage: Stage,
    /// How the failure was detected.
    pub kind: FailureKind,
    /// Human-readable detail: the error, or the missing path.
    pub detail: String,
}

// ──────────────────────────────── Settings ───────────────────────────

/// Batch-wide inputs shared by every job.
#[derive(Clone)]
pub struct JobSettings {
    /// Scratch directory for intermediate artifacts.
    pub work_dir: PathBuf,
    /// Upscale factor of the inputs.
    pub scale: u32,
    /// Per-stage deadline.
    pub stage_timeout: Option<Duration>,
    /// Which stages run in which phase.
    pub definition: Arc<PipelineDefinition>,
    /// The stage implementation.
    pub engine: Arc<dyn StageEngine>,
}

impl JobSettings {
    /// Settings for a batch under `work_dir` configured by `config`.
    pub fn new(
        work_dir: impl Into<PathBuf>,
        config: &RestoreConfig,
        engine: Arc<dyn StageEngine>,
    ) -> Self {
        Self {
            work_dir: work_dir.into(),
            scale: config.scale,
            stage_timeout: config.stage_timeout,
            definition: Arc::new(config.definition.clone()),
            engine,
        }
    }
}

impl fmt::Debug for JobSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSettings")
            .field("work_dir", &self.work_dir)
            .field("scale", &self.scale)
            .field("stage_timeout", &self.stage_timeout)
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

// ──────────────────────────────── Job ────────────────────────────────

/// Execution context for one page.
pub struct PipelineJob {
    context: StageContext,
    definition: Arc<PipelineDefinition>,
    engine: Arc<dyn StageEngine>,
    state: JobState,
    failed: bool,
    failures: Vec<StageFailure>,
    records: Vec<StageRecord>,
    straggler: Option<Straggler>,
}

/// The helper thread of a stage that timed out but has not returned.
struct Straggler {
    stage: Stage,
    handle: JoinHandle<()>,
}

/// Interval between checks on a straggling stage thread.
const STRAGGLER_POLL: Duration = Duration::from_millis(10);

impl PipelineJob {
    /// Validate inputs and derive artifact paths for one page.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidInput`] if the work directory,
    /// the destination directory, the source, or the upscaled source is
    /// missing. A job that fails here never enters the batch.
    pub fn new(entry: &BatchEntry, settings: &JobSettings) -> Result<Self, PipelineError> {
        let artifacts = ArtifactPaths::resolve(
            &settings.work_dir,
            &entry.upscayl,
            &entry.dest,
            settings.scale,
        )?;
        if !entry.srce.exists() {
            return Err(PipelineError::InvalidInput {
                kind: InputKind::SourceFile,
                path: entry.srce.clone(),
            });
        }

        Ok(Self {
            context: StageContext {
                srce_file: entry.srce.clone(),
                upscayl_file: entry.upscayl.clone(),
                scale: settings.scale,
                artifacts,
                timeout: settings.stage_timeout,
            },
            definition: Arc::clone(&settings.definition),
            engine: Arc::clone(&settings.engine),
            state: JobState::Constructed,
            failed: false,
            failures: Vec::new(),
            records: Vec::new(),
            straggler: None,
        })
    }

    /// The original scanned page.
    #[must_use]
    pub fn srce_file(&self) -> &Path {
        &self.context.srce_file
    }

    /// The upscaled page this job restores.
    #[must_use]
    pub fn upscayl_file(&self) -> &Path {
        &self.context.upscayl_file
    }

    /// The final restored page.
    #[must_use]
    pub fn dest_file(&self) -> &Path {
        self.context.artifacts.restored()
    }

    /// Upscale factor.
    #[must_use]
    pub const fn scale(&self) -> u32 {
        self.context.scale
    }

    /// All artifact paths of this job.
    #[must_use]
    pub const fn artifacts(&self) -> &ArtifactPaths {
        &self.context.artifacts
    }

    /// The context handed to the engine.
    #[must_use]
    pub const fn context(&self) -> &StageContext {
        &self.context
    }

    /// The pipeline variant this job runs.
    #[must_use]
    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> JobState {
        self.state
    }

    /// Whether any failure has been recorded. Once `true`, stays `true`.
    #[must_use]
    pub const fn failed(&self) -> bool {
        self.failed
    }

    /// Every failure recorded so far, in detection order.
    #[must_use]
    pub fn failures(&self) -> &[StageFailure] {
        &self.failures
    }

    /// Timing and outcome of every stage call so far.
    #[must_use]
    pub fn records(&self) -> &[StageRecord] {
        &self.records
    }

    /// Short identity for log lines.
    #[must_use]
    pub fn name(&self) -> String {
        self.upscayl_file().file_name().map_or_else(
            || self.upscayl_file().display().to_string(),
            |n| n.to_string_lossy().into_owned(),
        )
    }

    /// Phase 1: remove artifacts, then reduce colors.
    ///
    /// # Errors
    ///
    /// See [`run_phase`](Self::run_phase).
    pub fn run_phase1(&mut self) -> Result<PhaseOutcome, PipelineError> {
        self.run_phase(Phase::Prefilter)
    }

    /// Phase 2: smooth the color-reduced image.
    ///
    /// # Errors
    ///
    /// See [`run_phase`](Self::run_phase).
    pub fn run_phase2(&mut self) -> Result<PhaseOutcome, PipelineError> {
        self.run_phase(Phase::Smooth)
    }

    /// Phase 3: vectorize and rasterize the ink trace.
    ///
    /// # Errors
    ///
    /// See [`run_phase`](Self::run_phase).
    pub fn run_phase3(&mut self) -> Result<PhaseOutcome, PipelineError> {
        self.run_phase(Phase::Trace)
    }

    /// Phase 4: inpaint, overlay, and resize.
    ///
    /// # Errors
    ///
    /// See [`run_phase`](Self::run_phase).
    pub fn run_phase4(&mut self) -> Result<PhaseOutcome, PipelineError> {
        self.run_phase(Phase::Composite)
    }

    /// Run every enabled stage of `phase`, in order.
    ///
    /// Stage errors, panics, and timeouts are caught, logged with job
    /// context, recorded, and merged into [`failed`](Self::failed). They
    /// never abort the remaining stages.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::PhaseOrder`] without running anything if
    /// `phase` is not the job's next phase.
    pub fn run_phase(&mut self, phase: Phase) -> Result<PhaseOutcome, PipelineError> {
        if self.state.next_phase() != Some(phase) {
            return Err(PipelineError::PhaseOrder {
                requested: phase,
                state: self.state,
            });
        }

        let span = tracing::info_span!("job", page = %self.name(), phase = phase.name());
        let _guard = span.enter();

        let stages: Vec<Stage> = self.definition.stages_in(phase).collect();
        let mut records = Vec::with_capacity(stages.len());
        for stage in stages {
            records.push(self.run_stage(phase, stage));
        }

        let outcome = PhaseOutcome { phase, records };
        for (stage, reason) in outcome.failures() {
            self.record_failure(StageFailure {
                stage,
                kind: FailureKind::Stage,
                detail: reason.to_string(),
            });
        }
        self.records.extend(outcome.records.iter().cloned());
        self.state = JobState::PhaseDone(phase);
        Ok(outcome)
    }

    /// Mark the job failed because `stage`'s artifact at `path` is absent.
    pub fn record_missing_artifact(&mut self, stage: Stage, path: &Path) {
        self.record_failure(StageFailure {
            stage,
            kind: FailureKind::MissingArtifact,
            detail: format!("could not find output artifact \"{}\"", path.display()),
        });
    }

    fn record_failure(&mut self, failure: StageFailure) {
        self.failed = true;
        self.failures.push(failure);
    }

    fn run_stage(&mut self, phase: Phase, stage: Stage) -> StageRecord {
        let output = self.context.output(stage).to_path_buf();
        tracing::info!(
            stage = stage.name(),
            output = %output.display(),
            "generating stage output"
        );

        let start = Instant::now();
        let result = self.settle_straggler().and_then(|()| self.invoke(stage));
        let duration = start.elapsed();

        let outcome = match result {
            Ok(()) => {
                tracing::info!(
                    stage = stage.name(),
                    elapsed_secs = duration.as_secs(),
                    "time taken for {}",
                    output.file_name().unwrap_or_default().to_string_lossy()
                );
                StageOutcome::Succeeded
            }
            Err(err) => {
                tracing::error!(
                    stage = stage.name(),
                    upscayl = %self.upscayl_file().display(),
                    error = %err,
                    "stage failed"
                );
                StageOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        };

        StageRecord {
            stage,
            phase,
            duration,
            outcome,
        }
    }

    /// Wait, for at most one stage timeout, for a timed-out stage of this
    /// job to return, so that two stages of one job never overlap.
    fn settle_straggler(&mut self) -> Result<(), StageError> {
        let Some(straggler) = self.straggler.take() else {
            return Ok(());
        };
        let deadline = Instant::now() + self.context.timeout.unwrap_or_default();
        while !straggler.handle.is_finished() {
            if Instant::now() >= deadline {
                let stage = straggler.stage;
                tracing::warn!(stage = stage.name(), "timed-out stage is still running");
                self.straggler = Some(straggler);
                return Err(StageError::Overrun(stage));
            }
            thread::sleep(STRAGGLER_POLL);
        }
        if straggler.handle.join().is_err() {
            tracing::warn!(stage = straggler.stage.name(), "stage thread panicked");
        }
        Ok(())
    }

    /// Call the engine, bounded by the stage timeout if one is set.
    ///
    /// On timeout the helper thread is kept as the job's straggler; its
    /// late result is discarded.
    fn invoke(&mut self, stage: Stage) -> Result<(), StageError> {
        let Some(limit) = self.context.timeout else {
            return call_guarded(self.engine.as_ref(), stage, &self.context);
        };

        let (tx, rx) = mpsc::channel();
        let engine = Arc::clone(&self.engine);
        let ctx = self.context.clone();
        let handle = thread::Builder::new()
            .name(format!("stage-{}", stage.name()))
            .spawn(move || {
                // The receiver is gone if the job already gave up.
                let _ = tx.send(call_guarded(engine.as_ref(), stage, &ctx));
            })?;

        match rx.recv_timeout(limit) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(stage = stage.name(), "stage thread left running after timeout");
                self.straggler = Some(Straggler { stage, handle });
                Err(StageError::TimedOut(limit))
            }
            Err(RecvTimeoutError::Disconnected) => Err(StageError::Panicked(
                "stage thread exited without a result".to_string(),
            )),
        }
    }
}

impl fmt::Debug for PipelineJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineJob")
            .field("context", &self.context)
            .field("state", &self.state)
            .field("failed", &self.failed)
            .field("failures", &self.failures)
            .finish_non_exhaustive()
    }
}

/// Run one stage, converting a panic into [`StageError::Panicked`].
fn call_guarded(
    engine: &dyn StageEngine,
    stage: Stage,
    ctx: &StageContext,
) -> Result<(), StageError> {
    panic::catch_unwind(AssertUnwindSafe(|| engine.run(stage, ctx)))
        .unwrap_or_else(|payload| Err(StageError::Panicked(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
