//! Pure raster transforms used by the outpaint and masking stages.
//!
//! Everything here is stateless: inputs fully determine outputs, so the
//! functions can run on any thread without coordination.

pub mod codec;
pub mod mask;
pub mod outpaint;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage};
use thiserror::Error;

pub use mask::{
    build_selection_mask, combine_masks, grow_mask, invert_mask, mask_from_preview_batch,
    preview_map_from_batch, threshold_mask, MaskCombine,
};
pub use outpaint::{
    extend_canvas, prepare_outpaint, whiten_outpaint_mask, ExtendVariant, OutpaintCanvas,
    OutpaintGeometry,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CanvasError {
    #[error("invalid canvas geometry: {0}")]
    Geometry(String),
    #[error("no 4-channel preview image in a batch of {batch_len}")]
    NoMaskAvailable { batch_len: usize },
}

/// Proportionally downscale `image` by `scale` with bicubic resampling.
///
/// The output is `(⌊w·s⌋, ⌊h·s⌋)`. Scale must lie in `(0, 1)`; anything else
/// is rejected rather than producing a canvas the outpaint stage cannot use.
pub fn downscale(image: &DynamicImage, scale: f64) -> Result<DynamicImage, CanvasError> {
    let (width, height) = image.dimensions();
    let (scaled_width, scaled_height) = scaled_dimensions((width, height), scale)?;
    Ok(image.resize_exact(scaled_width, scaled_height, FilterType::CatmullRom))
}

/// All-zero mask matching the dimensions of `image`.
pub fn empty_mask(image: &DynamicImage) -> GrayImage {
    let (width, height) = image.dimensions();
    GrayImage::new(width, height)
}

pub(crate) fn scaled_dimensions(
    (width, height): (u32, u32),
    scale: f64,
) -> Result<(u32, u32), CanvasError> {
    if width == 0 || height == 0 {
        return Err(CanvasError::Geometry(format!(
            "source image is empty ({width}x{height})"
        )));
    }
    if !scale.is_finite() || scale <= 0.0 || scale >= 1.0 {
        return Err(CanvasError::Geometry(format!(
            "scale factor must be in (0, 1), got {scale}"
        )));
    }
    let scaled_width = scale_floor(width, scale);
    let scaled_height = scale_floor(height, scale);
    if scaled_width == 0 || scaled_height == 0 {
        return Err(CanvasError::Geometry(format!(
            "scale {scale} collapses {width}x{height} to an empty image"
        )));
    }
    Ok((scaled_width, scaled_height))
}

// Tolerance keeps products such as 1000 * 0.6 from flooring to 599.
fn scale_floor(value: u32, scale: f64) -> u32 {
    (f64::from(value) * scale + 1e-9).floor() as u32
}
