//! Stage 7: downscale the restored page to source resolution and embed
//! provenance.
//!
//! PNG destinations get one `tEXt` chunk per provenance entry. Other
//! formats are written without metadata.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use image::DynamicImage;

use crate::config::ResizeFilter;
use crate::error::EngineError;

/// Target size for dividing `(width, height)` by `scale`, rounded to
/// nearest and never below 1.
#[must_use]
pub const fn scaled_dimensions(width: u32, height: u32, scale: u32) -> (u32, u32) {
    if scale <= 1 {
        return (width, height);
    }
    (div_round(width, scale), div_round(height, scale))
}

const fn div_round(value: u32, scale: u32) -> u32 {
    let r = (value + scale / 2) / scale;
    if r == 0 { 1 } else { r }
}

/// Shrink `image` by `scale`.
#[must_use = "returns the downscaled image"]
pub fn downscale(image: &DynamicImage, scale: u32, filter: ResizeFilter) -> DynamicImage {
    let (w, h) = scaled_dimensions(image.width(), image.height(), scale);
    if (w, h) == (image.width(), image.height()) {
        return image.clone();
    }
    image.resize_exact(w, h, filter.to_image_filter())
}

/// Write `image` to `path`, embedding `metadata` when `path` is a PNG.
///
/// # Errors
///
/// Returns [`EngineError::Io`] if the file cannot be created,
/// [`EngineError::Png`] if PNG encoding fails, or [`EngineError::Image`]
/// for other formats.
pub fn write_with_metadata(
    image: &DynamicImage,
    path: &Path,
    metadata: &[(&str, String)],
) -> Result<(), EngineError> {
    let is_png = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("png"));
    if !is_png {
        tracing::debug!(path = %path.display(), "not a PNG, writing without metadata");
        image.save(path)?;
        return Ok(());
    }

    let (color, bytes) = if image.color().has_alpha() {
        (png::ColorType::Rgba, image.to_rgba8().into_raw())
    } else {
        (png::ColorType::Rgb, image.to_rgb8().into_raw())
    };

    let writer = BufWriter::new(File::create(path)?);
    let mut encoder = png::Encoder::new(writer, image.width(), image.height());
    encoder.set_color(color);
    encoder.set_depth(png::BitDepth::Eight);
    for (key, value) in metadata {
        encoder.add_text_chunk((*key).to_string(), value.clone())?;
    }
    let mut writer = encoder.write_header()?;
    writer.write_image_data(&bytes)?;
    writer.finish()?;
    Ok(())
}
