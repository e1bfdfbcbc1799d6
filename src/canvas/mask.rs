use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma};

use super::CanvasError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskCombine {
    /// Per-pixel maximum: union of two selections.
    Lighter,
    /// Per-pixel minimum: intersection of two selections.
    Darker,
}

/// Intensity map of the first 4-channel image in a backend batch.
///
/// Pixels with zero alpha read as 0; the rest keep their luma. A batch without
/// any 4-channel image has no preview in it, which is reported explicitly.
pub fn preview_map_from_batch(images: &[DynamicImage]) -> Result<GrayImage, CanvasError> {
    let preview = images
        .iter()
        .find(|image| image.color().has_alpha())
        .ok_or(CanvasError::NoMaskAvailable {
            batch_len: images.len(),
        })?;
    let luma_alpha = preview.to_luma_alpha8();
    Ok(GrayImage::from_fn(
        luma_alpha.width(),
        luma_alpha.height(),
        |x, y| {
            let [luma, alpha] = luma_alpha.get_pixel(x, y).0;
            if alpha == 0 {
                Luma([0])
            } else {
                Luma([luma])
            }
        },
    ))
}

/// Binary selection mask from the preview image of a batch.
pub fn mask_from_preview_batch(
    images: &[DynamicImage],
    precision: u8,
) -> Result<GrayImage, CanvasError> {
    preview_map_from_batch(images).map(|map| threshold_mask(&map, precision))
}

/// Pixels brighter than `precision` become 255, everything else 0.
pub fn threshold_mask(gray: &GrayImage, precision: u8) -> GrayImage {
    let mut out = gray.clone();
    for pixel in out.pixels_mut() {
        pixel.0[0] = if pixel.0[0] > precision { 255 } else { 0 };
    }
    out
}

pub fn invert_mask(mask: &GrayImage) -> GrayImage {
    let mut out = mask.clone();
    imageops::invert(&mut out);
    out
}

pub fn combine_masks(
    a: &GrayImage,
    b: &GrayImage,
    mode: MaskCombine,
) -> Result<GrayImage, CanvasError> {
    if a.dimensions() != b.dimensions() {
        return Err(CanvasError::Geometry(format!(
            "cannot combine masks of {:?} and {:?}",
            a.dimensions(),
            b.dimensions()
        )));
    }
    let mut out = a.clone();
    for (dst, src) in out.pixels_mut().zip(b.pixels()) {
        dst.0[0] = match mode {
            MaskCombine::Lighter => dst.0[0].max(src.0[0]),
            MaskCombine::Darker => dst.0[0].min(src.0[0]),
        };
    }
    Ok(out)
}

/// Grow a selection by `padding` pixels on each side.
///
/// The mask is enlarged to `width + 2·padding` keeping its aspect ratio, centre
/// cropped back to the original size and re-binarized.
pub fn grow_mask(mask: &GrayImage, padding: u32) -> GrayImage {
    let (width, height) = mask.dimensions();
    if padding == 0 || width == 0 || height == 0 {
        return mask.clone();
    }
    let grown_width = width + padding * 2;
    let aspect = f64::from(width) / f64::from(height);
    let grown_height = ((f64::from(grown_width) / aspect).round() as u32).max(height);
    let grown = imageops::resize(mask, grown_width, grown_height, FilterType::Triangle);

    let left = (grown_width - width) / 2;
    let top = (grown_height - height) / 2;
    let cropped = imageops::crop_imm(&grown, left, top, width, height).to_image();
    threshold_mask(&cropped, 127)
}

/// Union of the thresholded positive maps, minus the thresholded negative
/// maps, grown by `padding`.
pub fn build_selection_mask(
    positive: &[GrayImage],
    negative: &[GrayImage],
    precision: u8,
    padding: u32,
) -> Result<GrayImage, CanvasError> {
    let (first, rest) = positive.split_first().ok_or(CanvasError::NoMaskAvailable {
        batch_len: 0,
    })?;
    let mut selection = threshold_mask(first, precision);
    for map in rest {
        selection = combine_masks(
            &selection,
            &threshold_mask(map, precision),
            MaskCombine::Lighter,
        )?;
    }
    for map in negative {
        let keep = invert_mask(&threshold_mask(map, precision));
        selection = combine_masks(&selection, &keep, MaskCombine::Darker)?;
    }
    Ok(grow_mask(&selection, padding))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{LumaA, Rgb, RgbImage, RgbaImage, Rgba};

    fn square_map(size: u32, from: u32, to: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            if (from..to).contains(&x) && (from..to).contains(&y) {
                Luma([200])
            } else {
                Luma([30])
            }
        })
    }

    #[test]
    fn preview_mask_uses_first_rgba_image() {
        let opaque = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([255, 255, 255])));
        let preview = DynamicImage::ImageRgba8(RgbaImage::from_fn(4, 4, |x, _| {
            if x < 2 {
                Rgba([255, 255, 255, 255])
            } else {
                Rgba([255, 255, 255, 0])
            }
        }));

        let mask = mask_from_preview_batch(&[opaque, preview], 100).expect("mask should exist");
        assert_eq!(mask.get_pixel(0, 0).0[0], 255);
        assert_eq!(mask.get_pixel(3, 0).0[0], 0);
    }

    #[test]
    fn preview_mask_reports_missing_alpha_image() {
        let opaque = DynamicImage::ImageRgb8(RgbImage::new(4, 4));
        let err = mask_from_preview_batch(&[opaque.clone(), opaque], 100)
            .expect_err("no rgba image means no mask");
        assert_eq!(err, CanvasError::NoMaskAvailable { batch_len: 2 });
    }

    #[test]
    fn preview_mask_accepts_luma_alpha() {
        let preview = DynamicImage::ImageLumaA8(image::ImageBuffer::from_pixel(
            3,
            3,
            LumaA([180, 255]),
        ));
        let mask = mask_from_preview_batch(&[preview], 100).expect("mask should exist");
        assert!(mask.pixels().all(|p| p.0[0] == 255));
    }

    #[test]
    fn threshold_is_strictly_greater_than_precision() {
        let gray = GrayImage::from_fn(3, 1, |x, _| Luma([99 + x as u8]));
        let mask = threshold_mask(&gray, 100);
        assert_eq!(mask.get_pixel(0, 0).0[0], 0);
        assert_eq!(mask.get_pixel(1, 0).0[0], 0);
        assert_eq!(mask.get_pixel(2, 0).0[0], 255);
    }

    #[test]
    fn combine_rejects_mismatched_sizes() {
        let a = GrayImage::new(2, 2);
        let b = GrayImage::new(3, 2);
        assert!(combine_masks(&a, &b, MaskCombine::Lighter).is_err());
    }

    #[test]
    fn negative_maps_carve_out_of_selection() {
        let positive = square_map(20, 2, 18);
        let negative = square_map(20, 8, 12);
        let mask = build_selection_mask(&[positive], &[negative], 100, 0).expect("mask");

        assert_eq!(mask.get_pixel(3, 3).0[0], 255);
        assert_eq!(mask.get_pixel(10, 10).0[0], 0);
        assert_eq!(mask.get_pixel(0, 0).0[0], 0);
    }

    #[test]
    fn grow_mask_keeps_size_and_widens_selection() {
        let mask = threshold_mask(&square_map(40, 10, 30), 100);
        let grown = grow_mask(&mask, 4);

        assert_eq!(grown.dimensions(), (40, 40));
        let before = mask.pixels().filter(|p| p.0[0] == 255).count();
        let after = grown.pixels().filter(|p| p.0[0] == 255).count();
        assert!(after > before);
        assert_eq!(grown.get_pixel(0, 0).0[0], 0);
    }

    #[test]
    fn selection_requires_a_positive_map() {
        assert!(build_selection_mask(&[], &[], 100, 4).is_err());
    }
}
