use image::{DynamicImage, GenericImageView, GrayImage, ImageBuffer, Luma, Pixel};

use super::{downscale, empty_mask, CanvasError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtendVariant {
    /// Top-left placement; only the bottom margin is synthesized.
    Vertical,
    /// Horizontally centred placement; bottom, left and right margins are synthesized.
    Full,
}

impl ExtendVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vertical => "vertical",
            Self::Full => "full",
        }
    }
}

/// Placement of a downscaled image inside the original-size canvas.
///
/// Canvas extension and mask whitening both read their boundaries from this
/// value; the synthesized region of the mask therefore always lines up with
/// the extrapolated region of the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutpaintGeometry {
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub placed_width: u32,
    pub placed_height: u32,
    pub x_offset: u32,
    pub variant: ExtendVariant,
}

impl OutpaintGeometry {
    pub fn from_scale(
        canvas: (u32, u32),
        scale: f64,
        variant: ExtendVariant,
    ) -> Result<Self, CanvasError> {
        let placed = super::scaled_dimensions(canvas, scale)?;
        Self::for_placed(canvas, placed, variant)
    }

    pub fn for_placed(
        (canvas_width, canvas_height): (u32, u32),
        (placed_width, placed_height): (u32, u32),
        variant: ExtendVariant,
    ) -> Result<Self, CanvasError> {
        if placed_width == 0 || placed_height == 0 {
            return Err(CanvasError::Geometry(format!(
                "placed image is empty ({placed_width}x{placed_height})"
            )));
        }
        if placed_width > canvas_width || placed_height > canvas_height {
            return Err(CanvasError::Geometry(format!(
                "placed image {placed_width}x{placed_height} does not fit canvas {canvas_width}x{canvas_height}"
            )));
        }
        let x_offset = match variant {
            ExtendVariant::Vertical => 0,
            ExtendVariant::Full => (canvas_width - placed_width) / 2,
        };
        Ok(Self {
            canvas_width,
            canvas_height,
            placed_width,
            placed_height,
            x_offset,
            variant,
        })
    }

    /// First mask row that is fully selected: `⌊s·H⌋ − padding`.
    pub fn split_row(&self, padding: u32) -> u32 {
        self.placed_height.saturating_sub(padding)
    }

    /// Columns strictly left of this value are selected above the split row.
    pub fn left_boundary(&self, padding: u32) -> u32 {
        self.x_offset + padding
    }

    /// Columns strictly right of this value are selected above the split row.
    pub fn right_boundary(&self, padding: u32) -> u32 {
        (self.x_offset + self.placed_width).saturating_sub(padding)
    }
}

/// Place `placed` on a zero-filled canvas and extrapolate edge colours into
/// the margins described by `geometry`.
pub fn extend_canvas(
    placed: &DynamicImage,
    geometry: &OutpaintGeometry,
) -> Result<DynamicImage, CanvasError> {
    if placed.dimensions() != (geometry.placed_width, geometry.placed_height) {
        let (w, h) = placed.dimensions();
        return Err(CanvasError::Geometry(format!(
            "placed image is {w}x{h}, geometry expects {}x{}",
            geometry.placed_width, geometry.placed_height
        )));
    }
    Ok(match placed {
        DynamicImage::ImageRgb8(buf) => DynamicImage::ImageRgb8(extend_buffer(buf, geometry)),
        DynamicImage::ImageRgba8(buf) => DynamicImage::ImageRgba8(extend_buffer(buf, geometry)),
        other if other.color().has_alpha() => {
            DynamicImage::ImageRgba8(extend_buffer(&other.to_rgba8(), geometry))
        }
        other => DynamicImage::ImageRgb8(extend_buffer(&other.to_rgb8(), geometry)),
    })
}

fn extend_buffer<P>(
    placed: &ImageBuffer<P, Vec<u8>>,
    geometry: &OutpaintGeometry,
) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    let mut canvas = ImageBuffer::<P, Vec<u8>>::new(geometry.canvas_width, geometry.canvas_height);
    let x0 = geometry.x_offset;
    let placed_right = x0 + geometry.placed_width;

    for (x, y, pixel) in placed.enumerate_pixels() {
        canvas.put_pixel(x0 + x, y, *pixel);
    }

    if geometry.variant == ExtendVariant::Full {
        for y in 0..geometry.placed_height {
            let left = *placed.get_pixel(0, y);
            let right = *placed.get_pixel(geometry.placed_width - 1, y);
            for x in 0..x0 {
                canvas.put_pixel(x, y, left);
            }
            for x in placed_right..geometry.canvas_width {
                canvas.put_pixel(x, y, right);
            }
        }
    }

    let last_row = geometry.placed_height - 1;
    for x in 0..geometry.canvas_width {
        let edge = *canvas.get_pixel(x, last_row);
        for y in geometry.placed_height..geometry.canvas_height {
            canvas.put_pixel(x, y, edge);
        }
    }
    canvas
}

/// Mark the outpaint region of `mask` as selected.
pub fn whiten_outpaint_mask(
    mask: &mut GrayImage,
    geometry: &OutpaintGeometry,
    padding: u32,
) -> Result<(), CanvasError> {
    if mask.dimensions() != (geometry.canvas_width, geometry.canvas_height) {
        let (w, h) = mask.dimensions();
        return Err(CanvasError::Geometry(format!(
            "mask is {w}x{h}, canvas is {}x{}",
            geometry.canvas_width, geometry.canvas_height
        )));
    }
    let split = geometry.split_row(padding);
    let left = geometry.left_boundary(padding);
    let right = geometry.right_boundary(padding);
    let full = geometry.variant == ExtendVariant::Full;

    for (x, y, pixel) in mask.enumerate_pixels_mut() {
        if y >= split || (full && (x < left || x > right)) {
            *pixel = Luma([255]);
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct OutpaintCanvas {
    pub geometry: OutpaintGeometry,
    pub canvas: DynamicImage,
    pub mask: GrayImage,
}

/// Downscale, extend back to the source size and build the matching mask.
pub fn prepare_outpaint(
    source: &DynamicImage,
    scale: f64,
    variant: ExtendVariant,
    padding: u32,
) -> Result<OutpaintCanvas, CanvasError> {
    let geometry = OutpaintGeometry::from_scale(source.dimensions(), scale, variant)?;
    let placed = downscale(source, scale)?;
    let canvas = extend_canvas(&placed, &geometry)?;
    let mut mask = empty_mask(&canvas);
    whiten_outpaint_mask(&mut mask, &geometry, padding)?;
    Ok(OutpaintCanvas {
        geometry,
        canvas,
        mask,
    })
}
