//! Stage 5 preparation: mark the black ink on the upscaled page so the
//! inpainter fills it in with the surrounding colors.
//!
//! A pixel is removed when the color-reduced image is dark there, or when
//! the ink trace raster has visible dark ink there. Removed pixels are
//! painted pure red, the mask color the patch-match inpainter looks for.

use image::{GrayImage, Luma, Rgb, RgbImage, RgbaImage};

use crate::error::EngineError;

/// Mask color understood by the inpaint command.
pub const MASK_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

const REMOVE: u8 = 255;

/// Build the removal mask: 255 where ink must be inpainted over.
///
/// `colors_removed` is composited over white first, so its transparent
/// background never counts as ink. `ink_trace` is optional and must
/// match `colors_removed` in size.
///
/// # Errors
///
/// Returns [`EngineError::SizeMismatch`] if the trace size differs.
pub fn removal_mask(
    colors_removed: &RgbaImage,
    ink_trace: Option<&RgbaImage>,
    threshold: u8,
) -> Result<GrayImage, EngineError> {
    let (w, h) = colors_removed.dimensions();
    if let Some(trace) = ink_trace
        && trace.dimensions() != (w, h)
    {
        return Err(EngineError::SizeMismatch {
            what: "ink trace",
            actual: trace.dimensions(),
            expected: (w, h),
        });
    }

    let is_dark = |p: &image::Rgba<u8>| {
        // Red channel over a white background.
        let [r, _, _, a] = p.0;
        let over_white = 255 - (u16::from(255 - r) * u16::from(a) / 255);
        over_white <= u16::from(threshold)
    };

    Ok(GrayImage::from_fn(w, h, |x, y| {
        let ink = is_dark(colors_removed.get_pixel(x, y))
            || ink_trace.is_some_and(|t| is_dark(t.get_pixel(x, y)));
        Luma([if ink { REMOVE } else { 0 }])
    }))
}

/// Paint every masked pixel of `image` with [`MASK_COLOR`].
///
/// # Errors
///
/// Returns [`EngineError::SizeMismatch`] if the mask size differs.
pub fn paint_mask(image: &mut RgbImage, mask: &GrayImage) -> Result<usize, EngineError> {
    if image.dimensions() != mask.dimensions() {
        return Err(EngineError::SizeMismatch {
            what: "removal mask",
            actual: mask.dimensions(),
            expected: image.dimensions(),
        });
    }
    let mut painted = 0;
    for (pixel, m) in image.pixels_mut().zip(mask.pixels()) {
        if m.0[0] == REMOVE {
            *pixel = MASK_COLOR;
            painted += 1;
        }
    }
    Ok(painted)
}
