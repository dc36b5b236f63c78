//! Stages, phases, and the engine boundary.
//!
//! A restore pipeline is seven [`Stage`]s grouped into four [`Phase`]s:
//!
//! | Phase | Stages | Resource profile |
//! |---|---|---|
//! | [`Phase::Prefilter`] | remove artifacts, reduce colors | cheap, high concurrency |
//! | [`Phase::Smooth`] | smooth | memory hungry, tiered by host RAM |
//! | [`Phase::Trace`] | vectorize + rasterize trace | cheap, high concurrency |
//! | [`Phase::Composite`] | inpaint, overlay, resize | most memory hungry, single flight |
//!
//! Which stages are active, and in which phase, is data: a
//! [`PipelineDefinition`] is an ordered list of [`StageDescriptor`]s.
//! Stage implementations plug in through [`StageEngine`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::artifacts::ArtifactPaths;
use crate::tool::ToolError;
use crate::types::PipelineError;

/// Metadata key for the original scan path embedded in restored pages.
pub const SOURCE_FILE_KEY: &str = "Source file";
/// Metadata key for the upscaled source path embedded in restored pages.
pub const UPSCAYL_FILE_KEY: &str = "Upscayl file";
/// Metadata key for the upscale factor embedded in restored pages.
pub const UPSCAYL_SCALE_KEY: &str = "Upscayl scale";

// ──────────────────────────────── Phase ──────────────────────────────

/// One barrier-synchronized pass over the whole batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Phase 1: artifact removal and color reduction.
    Prefilter,
    /// Phase 2: anisotropic smoothing of the color-reduced image.
    Smooth,
    /// Phase 3: vectorization of the black ink and rasterization of the trace.
    Trace,
    /// Phase 4: inpainting, overlay, and resize back to source resolution.
    Composite,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Self; 4] = [Self::Prefilter, Self::Smooth, Self::Trace, Self::Composite];

    /// One-based phase number.
    #[must_use]
    pub const fn number(self) -> usize {
        match self {
            Self::Prefilter => 1,
            Self::Smooth => 2,
            Self::Trace => 3,
            Self::Composite => 4,
        }
    }

    /// Short lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Prefilter => "prefilter",
            Self::Smooth => "smooth",
            Self::Trace => "trace",
            Self::Composite => "composite",
        }
    }

    /// The phase that runs after this one, if any.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Prefilter => Some(Self::Smooth),
            Self::Smooth => Some(Self::Trace),
            Self::Trace => Some(Self::Composite),
            Self::Composite => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase {} ({})", self.number(), self.name())
    }
}

// ──────────────────────────────── Stage ──────────────────────────────

/// One named image transformation of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Remove scan and encode artifacts from the upscaled source.
    RemoveArtifacts,
    /// Reduce the artifact-filtered image to a restricted palette.
    ReduceColors,
    /// Smooth the color-reduced image.
    Smooth,
    /// Vectorize the smoothed black ink and rasterize the trace.
    Vectorize,
    /// Inpaint the upscaled source, guided by the color-reduced image
    /// and the ink trace.
    Inpaint,
    /// Composite the ink trace over the inpainted image.
    Overlay,
    /// Downscale the composite to source resolution with provenance
    /// metadata.
    Resize,
}

impl Stage {
    /// All stages in dependency order.
    pub const ALL: [Self; 7] = [
        Self::RemoveArtifacts,
        Self::ReduceColors,
        Self::Smooth,
        Self::Vectorize,
        Self::Inpaint,
        Self::Overlay,
        Self::Resize,
    ];

    /// One-based stage number.
    #[must_use]
    pub const fn number(self) -> usize {
        match self {
            Self::RemoveArtifacts => 1,
            Self::ReduceColors => 2,
            Self::Smooth => 3,
            Self::Vectorize => 4,
            Self::Inpaint => 5,
            Self::Overlay => 6,
            Self::Resize => 7,
        }
    }

    /// Short lowercase name used in logs and reports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::RemoveArtifacts => "remove-artifacts",
            Self::ReduceColors => "reduce-colors",
            Self::Smooth => "smooth",
            Self::Vectorize => "vectorize",
            Self::Inpaint => "inpaint",
            Self::Overlay => "overlay",
            Self::Resize => "resize",
        }
    }

    /// The phase this stage belongs to in the standard pipeline.
    #[must_use]
    pub const fn phase(self) -> Phase {
        match self {
            Self::RemoveArtifacts | Self::ReduceColors => Phase::Prefilter,
            Self::Smooth => Phase::Smooth,
            Self::Vectorize => Phase::Trace,
            Self::Inpaint | Self::Overlay | Self::Resize => Phase::Composite,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─────────────────────────── PipelineDefinition ──────────────────────

/// A stage's slot in a [`PipelineDefinition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// The stage.
    pub stage: Stage,
    /// The phase it runs in.
    pub phase: Phase,
    /// Disabled stages are neither invoked nor expected by the reporter.
    pub enabled: bool,
}

impl StageDescriptor {
    /// An enabled descriptor in the stage's standard phase.
    #[must_use]
    pub const fn standard(stage: Stage) -> Self {
        Self {
            stage,
            phase: stage.phase(),
            enabled: true,
        }
    }
}

/// Ordered list of stage descriptors making up one pipeline variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineDefinition {
    stages: Vec<StageDescriptor>,
}

impl PipelineDefinition {
    /// Build a definition from explicit descriptors.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if the descriptors fail
    /// [`validate`](Self::validate).
    pub fn new(stages: Vec<StageDescriptor>) -> Result<Self, PipelineError> {
        let definition = Self { stages };
        definition.validate()?;
        Ok(definition)
    }

    /// All descriptors, enabled or not, in execution order.
    #[must_use]
    pub fn descriptors(&self) -> &[StageDescriptor] {
        &self.stages
    }

    /// Disable `stage`, keeping its slot.
    #[must_use]
    pub fn without(mut self, stage: Stage) -> Self {
        for descriptor in &mut self.stages {
            if descriptor.stage == stage {
                descriptor.enabled = false;
            }
        }
        self
    }

    /// Whether `stage` is present and enabled.
    #[must_use]
    pub fn is_enabled(&self, stage: Stage) -> bool {
        self.stages.iter().any(|d| d.stage == stage && d.enabled)
    }

    /// Enabled stages, in execution order.
    pub fn enabled(&self) -> impl Iterator<Item = Stage> + '_ {
        self.stages.iter().filter(|d| d.enabled).map(|d| d.stage)
    }

    /// Enabled stages of one phase, in execution order.
    pub fn stages_in(&self, phase: Phase) -> impl Iterator<Item = Stage> + '_ {
        self.stages
            .iter()
            .filter(move |d| d.enabled && d.phase == phase)
            .map(|d| d.stage)
    }

    /// Check that stages appear at most once, in dependency order, and
    /// that phases never go backwards.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] describing the first
    /// violation found.
    pub fn validate(&self) -> Result<(), PipelineError> {
        for pair in self.stages.windows(2) {
            let (prev, next) = (pair[0], pair[1]);
            if next.stage <= prev.stage {
                return Err(PipelineError::InvalidConfig(format!(
                    "stage {} must come after {} and appear once",
                    prev.stage, next.stage
                )));
            }
            if next.phase < prev.phase {
                return Err(PipelineError::InvalidConfig(format!(
                    "stage {} runs in {} but follows {} in {}",
                    next.stage, next.phase, prev.stage, prev.phase
                )));
            }
        }
        Ok(())
    }
}

impl Default for PipelineDefinition {
    fn default() -> Self {
        Self {
            stages: Stage::ALL.map(StageDescriptor::standard).to_vec(),
        }
    }
}

// ──────────────────────────── Engine boundary ────────────────────────

/// Everything a stage implementation may read about its job.
///
/// Cloned onto a helper thread when a stage timeout is configured, so it
/// owns its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageContext {
    /// The original scanned page.
    pub srce_file: PathBuf,
    /// The upscaled copy of the page.
    pub upscayl_file: PathBuf,
    /// Upscale factor between the two.
    pub scale: u32,
    /// Every artifact path of the job.
    pub artifacts: ArtifactPaths,
    /// Deadline for a single stage call, forwarded to native tools.
    pub timeout: Option<Duration>,
}

impl StageContext {
    /// The named input files `stage` consumes.
    #[must_use]
    pub fn inputs(&self, stage: Stage) -> Vec<&Path> {
        let a = &self.artifacts;
        match stage {
            Stage::RemoveArtifacts => vec![&self.upscayl_file],
            Stage::ReduceColors => vec![a.artifacts_removed()],
            Stage::Smooth => vec![a.colors_removed()],
            Stage::Vectorize => vec![a.smoothed()],
            Stage::Inpaint => vec![&self.upscayl_file, a.colors_removed(), a.ink_trace_png()],
            Stage::Overlay => vec![a.inpainted(), a.ink_trace_png()],
            Stage::Resize => vec![a.restored_upscayl()],
        }
    }

    /// The primary output file of `stage`.
    #[must_use]
    pub fn output(&self, stage: Stage) -> &Path {
        self.artifacts.output(stage)
    }

    /// Provenance metadata embedded in the restored page.
    #[must_use]
    pub fn provenance(&self) -> Vec<(&'static str, String)> {
        vec![
            (SOURCE_FILE_KEY, self.srce_file.display().to_string()),
            (UPSCAYL_FILE_KEY, self.upscayl_file.display().to_string()),
            (UPSCAYL_SCALE_KEY, self.scale.to_string()),
        ]
    }
}

/// Fail with [`StageError::MissingInput`] if any input of `stage` is absent.
///
/// Engines call this first so that a failed upstream stage surfaces as a
/// clear missing-input failure rather than an opaque decode error.
///
/// # Errors
///
/// Returns [`StageError::MissingInput`] naming the first missing file.
pub fn require_inputs(stage: Stage, ctx: &StageContext) -> Result<(), StageError> {
    match ctx.inputs(stage).into_iter().find(|p| !p.exists()) {
        Some(missing) => Err(StageError::MissingInput(missing.to_path_buf())),
        None => Ok(()),
    }
}

/// Why a stage call failed.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// An input artifact does not exist, usually because an upstream
    /// stage failed.
    #[error("file not found: \"{}\"", .0.display())]
    MissingInput(PathBuf),

    /// A native tool failed.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Filesystem error while reading inputs or writing the output.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stage did not return within the configured timeout.
    #[error("stage timed out after {0:?}")]
    TimedOut(Duration),

    /// An earlier stage of the same job timed out and is still running,
    /// so this one was not started.
    #[error("not started: {0} stage timed out earlier and is still running")]
    Overrun(Stage),

    /// The stage implementation panicked.
    #[error("stage panicked: {0}")]
    Panicked(String),

    /// Any other engine-specific failure.
    #[error("{0}")]
    Failed(String),
}

/// A stage implementation.
///
/// Calls for different jobs run concurrently inside one phase pool and
/// must not share mutable state. Calls for one job are always
/// sequential. An implementation signals success by returning `Ok` with
/// `ctx.output(stage)` written; it must not rely on the job having
/// checked its inputs.
pub trait StageEngine: Send + Sync {
    /// Run `stage` for the job described by `ctx`.
    ///
    /// # Errors
    ///
    /// Any [`StageError`]; the job records it and continues.
    fn run(&self, stage: Stage, ctx: &StageContext) -> Result<(), StageError>;
}
