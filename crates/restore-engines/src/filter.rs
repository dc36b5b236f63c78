//! In-process pixel filters for phase 1.
//!
//! [`remove_artifacts`] is a median filter that leaves black ink alone:
//! ink is found with a Gaussian adaptive threshold, the mask is grown a
//! little, and only unmasked pixels are filtered, using only unmasked
//! neighbors. This cleans JPEG and upscaler noise out of flat color
//! areas without eroding line work.
//!
//! [`posterize`] and [`remove_colors`] reduce the filtered page to its
//! black ink on a transparent background.

use image::{GrayImage, Luma, Rgb, RgbImage, Rgba, RgbaImage};

use crate::config::{EngineConfig, MedianConfig};

const INK: u8 = 255;

/// Black-ink mask: 255 where a pixel is darker than its Gaussian-weighted
/// neighborhood by more than `offset`, 0 elsewhere.
#[must_use = "returns the ink mask"]
pub fn ink_mask(gray: &GrayImage, sigma: f32, offset: f32) -> GrayImage {
    let local_mean = imageproc::filter::gaussian_blur_f32(gray, sigma);
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let value = f32::from(gray.get_pixel(x, y).0[0]);
        let mean = f32::from(local_mean.get_pixel(x, y).0[0]);
        if value <= mean - offset {
            Luma([INK])
        } else {
            Luma([0])
        }
    })
}

/// Grow `mask` by blurring its inverse and re-thresholding at `threshold`.
///
/// Non-positive sigma returns the mask unchanged.
#[must_use = "returns the grown mask"]
pub fn grow_mask(mask: &GrayImage, sigma: f32, threshold: u8) -> GrayImage {
    if sigma <= 0.0 {
        return mask.clone();
    }
    let mut inverted = mask.clone();
    image::imageops::invert(&mut inverted);
    let blurred = imageproc::filter::gaussian_blur_f32(&inverted, sigma);
    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        if blurred.get_pixel(x, y).0[0] <= threshold {
            Luma([INK])
        } else {
            Luma([0])
        }
    })
}

/// Per-channel median of `image` over a `kernel_size` square window,
/// skipping every pixel set in `mask`.
///
/// Masked pixels are copied through unchanged. Pixels outside the image
/// count as masked. An unmasked pixel whose whole window is masked keeps
/// its value. Where `mask` is smaller than `image`, the missing mask
/// pixels count as masked.
#[must_use = "returns the filtered image"]
pub fn masked_median(image: &RgbImage, mask: &GrayImage, kernel_size: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    let radius = i64::from(kernel_size / 2);
    let is_masked = |x: i64, y: i64| -> bool {
        u32::try_from(x)
            .ok()
            .zip(u32::try_from(y).ok())
            .and_then(|(x, y)| mask.get_pixel_checked(x, y))
            .is_none_or(|p| p.0[0] > 0)
    };

    let window = (kernel_size * kernel_size) as usize;
    let mut channels: [Vec<u8>; 3] = std::array::from_fn(|_| Vec::with_capacity(window));

    RgbImage::from_fn(w, h, |x, y| {
        let original = *image.get_pixel(x, y);
        let (cx, cy) = (i64::from(x), i64::from(y));
        if is_masked(cx, cy) {
            return original;
        }

        for c in &mut channels {
            c.clear();
        }
        for ny in (cy - radius)..=(cy + radius) {
            for nx in (cx - radius)..=(cx + radius) {
                if is_masked(nx, ny) {
                    continue;
                }
                // Unmasked implies in bounds.
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let p = image.get_pixel(nx as u32, ny as u32);
                for (c, values) in channels.iter_mut().enumerate() {
                    values.push(p.0[c]);
                }
            }
        }

        if channels[0].is_empty() {
            return original;
        }
        Rgb([
            median(&mut channels[0]),
            median(&mut channels[1]),
            median(&mut channels[2]),
        ])
    })
}

/// Median of a non-empty slice; the mean of the two middle values for
/// even lengths.
fn median(values: &mut [u8]) -> u8 {
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        let sum = u16::from(values[mid - 1]) + u16::from(values[mid]);
        // Mean of two u8 values fits in u8.
        #[allow(clippy::cast_possible_truncation)]
        let mean = (sum / 2) as u8;
        mean
    }
}

/// Stage 1: median filter everything except black ink.
#[must_use = "returns the filtered image"]
pub fn remove_artifacts(image: &RgbImage, config: &MedianConfig) -> RgbImage {
    let gray = image::imageops::grayscale(image);
    let ink = ink_mask(&gray, config.threshold_sigma(), config.threshold_offset);
    let grown = grow_mask(&ink, config.mask_blur_sigma, config.mask_threshold);
    masked_median(image, &grown, config.kernel_size)
}

/// Quantize every channel to `levels` evenly spaced values, in place.
///
/// `levels` below 2 is a no-op; more than 256 levels act as 256.
pub fn posterize(image: &mut RgbImage, levels: u32) {
    if levels < 2 {
        return;
    }
    let levels = levels.min(EngineConfig::MAX_POSTERIZE_LEVELS);
    let top = levels - 1;
    // Every quantized value is at most 255.
    #[allow(clippy::cast_possible_truncation)]
    let table: [u8; 256] = std::array::from_fn(|v| {
        let bucket = (v as u32 * levels / 255).min(top);
        (bucket * 255 / top) as u8
    });
    for pixel in image.pixels_mut() {
        for c in &mut pixel.0 {
            *c = table[usize::from(*c)];
        }
    }
}

/// Keep only pixels whose every channel is at or below the first
/// posterize level; everything else becomes transparent white.
#[must_use = "returns the ink-only image"]
pub fn remove_colors(image: &RgbImage, levels: u32) -> RgbaImage {
    let first_level = u8::try_from(255 / levels.saturating_sub(1).max(1)).unwrap_or(u8::MAX);
    RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        let Rgb([r, g, b]) = *image.get_pixel(x, y);
        if r > first_level || g > first_level || b > first_level {
            Rgba([255, 255, 255, 0])
        } else {
            Rgba([r, g, b, 255])
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// White page with a one-pixel-wide black vertical line at x=8.
    fn line_page() -> RgbImage {
        RgbImage::from_fn(17, 17, |x, _| {
            if x == 8 { Rgb([0, 0, 0]) } else { Rgb([240, 240, 240]) }
        })
    }

    #[test]
    fn ink_mask_finds_dark_line() {
        let gray = image::imageops::grayscale(&line_page());
        let mask = ink_mask(&gray, 3.5, 12.0);
        assert_eq!(mask.get_pixel(8, 8).0[0], INK);
        assert_eq!(mask.get_pixel(2, 8).0[0], 0);
    }

    #[test]
    fn grow_mask_widens_line_by_one_pixel() {
        let mask = GrayImage::from_fn(9, 9, |x, _| Luma([if x == 4 { INK } else { 0 }]));
        let grown = grow_mask(&mask, 0.8, 200);
        assert_eq!(grown.get_pixel(4, 4).0[0], INK);
        assert_eq!(grown.get_pixel(3, 4).0[0], INK);
        assert_eq!(grown.get_pixel(5, 4).0[0], INK);
        assert_eq!(grown.get_pixel(1, 4).0[0], 0);
    }

    #[test]
    fn median_removes_isolated_speck() {
        let mut img = RgbImage::from_pixel(9, 9, Rgb([200, 100, 50]));
        img.put_pixel(4, 4, Rgb([255, 255, 255]));
        let out = masked_median(&img, &GrayImage::new(9, 9), 3);
        assert_eq!(*out.get_pixel(4, 4), Rgb([200, 100, 50]));
    }

    #[test]
    fn masked_pixels_pass_through() {
        let mut img = RgbImage::from_pixel(9, 9, Rgb([200, 100, 50]));
        img.put_pixel(4, 4, Rgb([0, 0, 0]));
        let mut mask = GrayImage::new(9, 9);
        mask.put_pixel(4, 4, Luma([INK]));
        let out = masked_median(&img, &mask, 3);
        assert_eq!(*out.get_pixel(4, 4), Rgb([0, 0, 0]));
        // Neighbors ignore the masked ink pixel.
        assert_eq!(*out.get_pixel(4, 3), Rgb([200, 100, 50]));
    }

    #[test]
    fn surrounded_pixel_uses_only_itself() {
        let img = RgbImage::from_pixel(3, 3, Rgb([10, 20, 30]));
        let mut mask = GrayImage::from_pixel(3, 3, Luma([INK]));
        mask.put_pixel(1, 1, Luma([0]));
        let out = masked_median(&img, &mask, 3);
        assert_eq!(*out.get_pixel(1, 1), Rgb([10, 20, 30]));
    }

    #[test]
    fn even_median_averages_middle_values() {
        assert_eq!(median(&mut [10, 20, 30, 40]), 25);
        assert_eq!(median(&mut [7]), 7);
    }

    #[test]
    fn remove_artifacts_keeps_line_work() {
        let page = line_page();
        let out = remove_artifacts(&page, &MedianConfig::default());
        assert_eq!(*out.get_pixel(8, 8), Rgb([0, 0, 0]));
        assert_eq!(out.dimensions(), page.dimensions());
    }

    #[test]
    fn posterize_snaps_to_levels() {
        let mut img = RgbImage::from_fn(4, 1, |x, _| match x {
            0 => Rgb([0, 40, 60]),
            1 => Rgb([100, 130, 160]),
            2 => Rgb([210, 254, 255]),
            _ => Rgb([51, 52, 204]),
        });
        posterize(&mut img, 5);
        assert_eq!(*img.get_pixel(0, 0), Rgb([0, 0, 63]));
        assert_eq!(*img.get_pixel(1, 0), Rgb([63, 127, 191]));
        assert_eq!(*img.get_pixel(2, 0), Rgb([255, 255, 255]));
        assert_eq!(*img.get_pixel(3, 0), Rgb([63, 63, 255]));
    }

    #[test]
    fn huge_level_count_is_identity() {
        let original = RgbImage::from_fn(4, 1, |x, _| match x {
            0 => Rgb([0, 1, 2]),
            1 => Rgb([100, 127, 128]),
            2 => Rgb([200, 253, 254]),
            _ => Rgb([255, 255, 255]),
        });
        let mut img = original.clone();
        posterize(&mut img, u32::MAX);
        assert_eq!(img, original);
    }

    #[test]
    fn remove_colors_keeps_only_dark_pixels() {
        let img = RgbImage::from_fn(3, 1, |x, _| match x {
            0 => Rgb([0, 0, 0]),
            1 => Rgb([63, 63, 63]),
            _ => Rgb([0, 127, 0]),
        });
        let out = remove_colors(&img, 5);
        assert_eq!(*out.get_pixel(0, 0), Rgba([0, 0, 0, 255]));
        assert_eq!(*out.get_pixel(1, 0), Rgba([63, 63, 63, 255]));
        assert_eq!(*out.get_pixel(2, 0), Rgba([255, 255, 255, 0]));
    }
}
