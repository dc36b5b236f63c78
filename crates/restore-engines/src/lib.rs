//! restore-engines: the concrete stages behind [`StageEngine`].
//!
//! Cheap pixel work (artifact removal, color reduction, mask painting,
//! the final resize) runs in-process on `image`/`imageproc`. Heavy or
//! specialized work (anisotropic smoothing, vectorizing, rasterizing,
//! patch-match inpainting, compositing) is delegated to native tools
//! through [`ToolCommand`](restore_pipeline::ToolCommand), which honors
//! the stage timeout.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use restore_engines::{EngineConfig, RestoreEngine};
//! # use restore_pipeline::StageEngine;
//! let engine: Arc<dyn StageEngine> = Arc::new(RestoreEngine::new(EngineConfig::default()));
//! ```

pub mod config;
pub mod error;
pub mod filter;
pub mod inpaint;
pub mod resize;
pub mod tools;

use std::path::Path;

use image::RgbaImage;
use restore_pipeline::stage::require_inputs;
use restore_pipeline::{Stage, StageContext, StageEngine, StageError};

pub use config::{EngineConfig, MedianConfig, ResizeFilter, SmoothParams, TraceParams};
pub use error::EngineError;

/// The production stage implementation.
#[derive(Debug, Clone, Default)]
pub struct RestoreEngine {
    config: EngineConfig,
}

impl RestoreEngine {
    /// An engine with the given tunables.
    #[must_use]
    pub const fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// The tunables in use.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn remove_artifacts(&self, ctx: &StageContext) -> Result<(), EngineError> {
        let page = image::open(&ctx.upscayl_file)?.to_rgb8();
        let filtered = filter::remove_artifacts(&page, &self.config.median);
        filtered.save(ctx.artifacts.artifacts_removed())?;
        Ok(())
    }

    fn reduce_colors(&self, ctx: &StageContext) -> Result<(), EngineError> {
        let levels = self.config.posterize_levels;
        let mut page = image::open(ctx.artifacts.artifacts_removed())?.to_rgb8();
        filter::posterize(&mut page, levels);
        page.save(ctx.artifacts.scratch("posterized-pre-remove-colors", "png"))?;
        filter::remove_colors(&page, levels).save(ctx.artifacts.colors_removed())?;
        Ok(())
    }

    fn smooth(&self, ctx: &StageContext) -> Result<(), EngineError> {
        let a = &ctx.artifacts;
        tools::smooth(&self.config, a.colors_removed(), a.smoothed())
            .timeout(ctx.timeout)
            .run()?;
        Ok(())
    }

    fn vectorize(&self, ctx: &StageContext) -> Result<(), EngineError> {
        let a = &ctx.artifacts;
        tools::vectorize(&self.config, a.smoothed(), a.ink_trace_svg())
            .timeout(ctx.timeout)
            .run()?;
        tracing::info!(png = %a.ink_trace_png().display(), "rasterizing trace");
        tools::rasterize(&self.config, a.ink_trace_svg(), a.ink_trace_png())
            .timeout(ctx.timeout)
            .run()?;
        Ok(())
    }

    fn inpaint(&self, ctx: &StageContext) -> Result<(), EngineError> {
        let a = &ctx.artifacts;
        let mut page = image::open(&ctx.upscayl_file)?.to_rgb8();
        let reduced = image::open(a.colors_removed())?.to_rgba8();
        let trace = load_trace(a.ink_trace_png(), reduced.dimensions())?;

        let mask = inpaint::removal_mask(&reduced, trace.as_ref(), self.config.ink_threshold)?;
        mask.save(a.scratch("remove-mask", "png"))?;
        let painted = inpaint::paint_mask(&mut page, &mask)?;
        tracing::debug!(pixels = painted, "marked ink for inpainting");

        let black_removed = a.scratch("input-black-removed", "png");
        page.save(&black_removed)?;
        tools::inpaint(&self.config, &black_removed, a.inpainted())
            .timeout(ctx.timeout)
            .run()?;
        Ok(())
    }

    fn overlay(&self, ctx: &StageContext) -> Result<(), EngineError> {
        let a = &ctx.artifacts;
        tools::overlay(
            &self.config,
            a.inpainted(),
            a.ink_trace_png(),
            a.restored_upscayl(),
        )
        .timeout(ctx.timeout)
        .run()?;
        Ok(())
    }

    fn resize(&self, ctx: &StageContext) -> Result<(), EngineError> {
        let restored = image::open(ctx.artifacts.restored_upscayl())?;
        let small = resize::downscale(&restored, ctx.scale, self.config.resize_filter);
        resize::write_with_metadata(&small, ctx.artifacts.restored(), &ctx.provenance())
    }
}

/// Load the trace raster, skipping it with a warning when its size does
/// not match the page. The trace is a guide, not a requirement.
fn load_trace(path: &Path, expected: (u32, u32)) -> Result<Option<RgbaImage>, EngineError> {
    let trace = image::open(path)?.to_rgba8();
    if trace.dimensions() == expected {
        Ok(Some(trace))
    } else {
        tracing::warn!(
            path = %path.display(),
            actual = ?trace.dimensions(),
            ?expected,
            "ink trace size differs from page, inpainting from color mask only"
        );
        Ok(None)
    }
}

impl StageEngine for RestoreEngine {
    fn run(&self, stage: Stage, ctx: &StageContext) -> Result<(), StageError> {
        require_inputs(stage, ctx)?;
        let result = match stage {
            Stage::RemoveArtifacts => self.remove_artifacts(ctx),
            Stage::ReduceColors => self.reduce_colors(ctx),
            Stage::Smooth => self.smooth(ctx),
            Stage::Vectorize => self.vectorize(ctx),
            Stage::Inpaint => self.inpaint(ctx),
            Stage::Overlay => self.overlay(ctx),
            Stage::Resize => self.resize(ctx),
        };
        Ok(result?)
    }
}
