use std::io::Cursor;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use image::{DynamicImage, GrayImage, ImageFormat};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("image base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("image codec failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Decode a base64 image payload. A `data:image/...;base64,` prefix is accepted.
pub fn decode_base64_image(payload: &str) -> Result<DynamicImage, CodecError> {
    let trimmed = payload.trim();
    let raw = match trimmed.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => trimmed,
    };
    let bytes = BASE64_STANDARD.decode(raw.as_bytes())?;
    Ok(image::load_from_memory(bytes.as_slice())?)
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, CodecError> {
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

pub fn encode_png_base64(image: &DynamicImage) -> Result<String, CodecError> {
    Ok(BASE64_STANDARD.encode(encode_png(image)?))
}

pub fn encode_mask_base64(mask: &GrayImage) -> Result<String, CodecError> {
    encode_png_base64(&DynamicImage::ImageLuma8(mask.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgba, RgbaImage};

    #[test]
    fn accepts_data_url_prefix() {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(3, 2, Rgba([1, 2, 3, 4])));
        let encoded = encode_png_base64(&image).expect("encode");
        let decoded = decode_base64_image(format!("data:image/png;base64,{encoded}").as_str())
            .expect("decode");
        assert_eq!(decoded.dimensions(), (3, 2));
        assert!(decoded.color().has_alpha());
    }

    #[test]
    fn rejects_invalid_base64() {
        let err = decode_base64_image("not base64!!").expect_err("decode should fail");
        assert!(matches!(err, CodecError::Base64(_)));
    }
}
