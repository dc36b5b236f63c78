//! Tunables for the concrete stage engines.
//!
//! Defaults reproduce the production restore settings. Every field can
//! be overridden from the batch configuration file.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Resampling filter for the final downscale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeFilter {
    /// Nearest-neighbor: fastest, blocky.
    Nearest,
    /// Bilinear: fast, averages neighbors.
    #[default]
    Triangle,
    /// Bicubic (Catmull-Rom).
    CatmullRom,
    /// Gaussian: soft.
    Gaussian,
    /// Lanczos with 3 lobes: sharpest.
    Lanczos3,
}

impl ResizeFilter {
    /// The matching `image` resampling filter.
    #[must_use]
    pub const fn to_image_filter(self) -> image::imageops::FilterType {
        match self {
            Self::Nearest => image::imageops::FilterType::Nearest,
            Self::Triangle => image::imageops::FilterType::Triangle,
            Self::CatmullRom => image::imageops::FilterType::CatmullRom,
            Self::Gaussian => image::imageops::FilterType::Gaussian,
            Self::Lanczos3 => image::imageops::FilterType::Lanczos3,
        }
    }
}

impl fmt::Display for ResizeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nearest => f.write_str("Nearest"),
            Self::Triangle => f.write_str("Triangle"),
            Self::CatmullRom => f.write_str("CatmullRom"),
            Self::Gaussian => f.write_str("Gaussian"),
            Self::Lanczos3 => f.write_str("Lanczos3"),
        }
    }
}

/// Ink-preserving median filter settings (stage 1).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MedianConfig {
    /// Side of the square median window. Must be odd.
    pub kernel_size: u32,
    /// Side of the adaptive threshold neighborhood used to find black
    /// ink. Must be odd.
    pub threshold_block_size: u32,
    /// Amount subtracted from the local mean before thresholding.
    /// Larger values keep fewer pixels as ink.
    pub threshold_offset: f32,
    /// Sigma of the blur that grows the ink mask.
    pub mask_blur_sigma: f32,
    /// Blurred-mask level at or below which a pixel counts as ink.
    pub mask_threshold: u8,
}

impl MedianConfig {
    /// Default median window.
    pub const DEFAULT_KERNEL_SIZE: u32 = 7;
    /// Default adaptive threshold neighborhood.
    pub const DEFAULT_THRESHOLD_BLOCK_SIZE: u32 = 21;
    /// Default adaptive threshold offset.
    pub const DEFAULT_THRESHOLD_OFFSET: f32 = 12.0;
    /// Default sigma for growing the ink mask (a 3x3 Gaussian).
    pub const DEFAULT_MASK_BLUR_SIGMA: f32 = 0.8;
    /// Default grown-mask threshold.
    pub const DEFAULT_MASK_THRESHOLD: u8 = 200;

    /// Gaussian sigma equivalent to a `threshold_block_size` window.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn threshold_sigma(&self) -> f32 {
        0.3f32.mul_add((self.threshold_block_size as f32 - 1.0) * 0.5 - 1.0, 0.8)
    }
}

impl Default for MedianConfig {
    fn default() -> Self {
        Self {
            kernel_size: Self::DEFAULT_KERNEL_SIZE,
            threshold_block_size: Self::DEFAULT_THRESHOLD_BLOCK_SIZE,
            threshold_offset: Self::DEFAULT_THRESHOLD_OFFSET,
            mask_blur_sigma: Self::DEFAULT_MASK_BLUR_SIGMA,
            mask_threshold: Self::DEFAULT_MASK_THRESHOLD,
        }
    }
}

/// Parameters of G'MIC's `fx_smooth_anisotropic` filter (stage 3).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothParams {
    pub amplitude: f32,
    pub sharpness: f32,
    pub anisotropy: f32,
    pub alpha: f32,
    pub sigma: f32,
    pub dl: f32,
    pub da: f32,
    pub precision: f32,
    /// 0 = nearest neighbor.
    pub interpolation: u32,
    pub fast_approx: bool,
    pub repeat: u32,
    pub channels: u32,
    /// Threshold applied after smoothing, in percent.
    pub threshold: u32,
}

impl SmoothParams {
    /// The comma-separated argument G'MIC expects.
    #[must_use]
    pub fn to_gmic_arg(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{},{},{}",
            self.amplitude,
            self.sharpness,
            self.anisotropy,
            self.alpha,
            self.sigma,
            self.dl,
            self.da,
            self.precision,
            self.interpolation,
            u8::from(self.fast_approx),
            self.repeat,
            self.channels
        )
    }
}

impl Default for SmoothParams {
    fn default() -> Self {
        Self {
            amplitude: 420.0,
            sharpness: 0.5,
            anisotropy: 0.6,
            alpha: 2.5,
            sigma: 5.0,
            dl: 0.8,
            da: 30.0,
            precision: 2.0,
            interpolation: 0,
            fast_approx: true,
            repeat: 2,
            channels: 0,
            threshold: 100,
        }
    }
}

/// Binary-mode vtracer settings (stage 4).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceParams {
    /// Decimal places in SVG path coordinates.
    pub path_precision: u32,
    /// Discard patches smaller than this many pixels.
    pub filter_speckle: u32,
    /// Minimum angle (degrees) treated as a corner.
    pub corner_threshold: u32,
    /// Subdivide until every segment is shorter than this.
    pub segment_length: f32,
    /// Minimum angle displacement (degrees) to splice a spline.
    pub splice_threshold: u32,
}

impl Default for TraceParams {
    fn default() -> Self {
        Self {
            path_precision: 3,
            filter_speckle: 2,
            corner_threshold: 60,
            segment_length: 24.0,
            splice_threshold: 45,
        }
    }
}

/// Everything [`RestoreEngine`](crate::RestoreEngine) can be tuned with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// G'MIC executable.
    pub gmic: String,
    /// vtracer executable.
    pub vtracer: String,
    /// resvg executable.
    pub resvg: String,

    /// Stage 1 settings.
    pub median: MedianConfig,

    /// Number of posterize levels per channel in stage 2.
    pub posterize_levels: u32,

    /// Stage 3 settings.
    pub smooth: SmoothParams,

    /// Stage 4 settings.
    pub trace: TraceParams,

    /// Color-reduced level at or below which a pixel is ink and gets
    /// inpainted over in stage 5.
    pub ink_threshold: u8,

    /// Stage 7 resampling filter.
    pub resize_filter: ResizeFilter,
}

impl EngineConfig {
    /// Default G'MIC executable name.
    pub const DEFAULT_GMIC: &'static str = "gmic";
    /// Default vtracer executable name.
    pub const DEFAULT_VTRACER: &'static str = "vtracer";
    /// Default resvg executable name.
    pub const DEFAULT_RESVG: &'static str = "resvg";
    /// Default posterize levels.
    pub const DEFAULT_POSTERIZE_LEVELS: u32 = 5;
    /// Most posterize levels an 8-bit channel can hold.
    pub const MAX_POSTERIZE_LEVELS: u32 = 256;
    /// Default inpaint ink threshold.
    pub const DEFAULT_INK_THRESHOLD: u8 = 100;

    /// Check invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] for even or tiny window
    /// sizes, posterize levels outside `2..=256`, or empty program names.
    pub fn validate(&self) -> Result<(), EngineError> {
        let odd = |name: &str, v: u32| {
            if v < 3 || v % 2 == 0 {
                Err(EngineError::InvalidConfig(format!(
                    "{name} must be odd and at least 3, got {v}"
                )))
            } else {
                Ok(())
            }
        };
        odd("median.kernel_size", self.median.kernel_size)?;
        odd(
            "median.threshold_block_size",
            self.median.threshold_block_size,
        )?;
        if !(2..=Self::MAX_POSTERIZE_LEVELS).contains(&self.posterize_levels) {
            return Err(EngineError::InvalidConfig(format!(
                "posterize_levels must be between 2 and {}, got {}",
                Self::MAX_POSTERIZE_LEVELS,
                self.posterize_levels
            )));
        }
        for (name, program) in [
            ("gmic", &self.gmic),
            ("vtracer", &self.vtracer),
            ("resvg", &self.resvg),
        ] {
            if program.trim().is_empty() {
                return Err(EngineError::InvalidConfig(format!(
                    "{name} program must not be empty"
                )));
            }
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gmic: Self::DEFAULT_GMIC.to_string(),
            vtracer: Self::DEFAULT_VTRACER.to_string(),
            resvg: Self::DEFAULT_RESVG.to_string(),
            median: MedianConfig::default(),
            posterize_levels: Self::DEFAULT_POSTERIZE_LEVELS,
            smooth: SmoothParams::default(),
            trace: TraceParams::default(),
            ink_threshold: Self::DEFAULT_INK_THRESHOLD,
            resize_filter: ResizeFilter::default(),
        }
    }
}
