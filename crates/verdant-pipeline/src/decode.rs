//! Image decoding.
//!
//! Accepts raw image bytes (PNG, JPEG, BMP, WebP) and produces the RGBA
//! pixel buffer every later stage works on. This is the first step of an
//! analysis: raw bytes in, `RgbaImage` out.

use image::RgbaImage;

use crate::types::PipelineError;

/// Decode raw image bytes into an RGBA buffer.
///
/// Supports whatever the `image` crate was built with (PNG, JPEG, BMP,
/// WebP). Images without an alpha channel come back fully opaque.
///
/// # Errors
///
/// Returns [`PipelineError::EmptyInput`] if `bytes` is empty.
/// Returns [`PipelineError::ImageDecode`] if the image format is
/// unrecognized or the data is corrupt.
pub fn decode_rgba(bytes: &[u8]) -> Result<RgbaImage, PipelineError> {
    if bytes.is_empty() {
        return Err(PipelineError::EmptyInput);
    }

    let img = image::load_from_memory(bytes)?;
    Ok(img.to_rgba8())
}

/// Encode an RGBA buffer as PNG bytes.
///
/// Used to hand a captured camera frame or test fixture to code that
/// expects an encoded [`RawImage`](crate::RawImage).
///
/// # Errors
///
/// Returns [`PipelineError::ImageDecode`] if the encoder rejects the
/// buffer.
pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>, PipelineError> {
    let mut buf = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut buf);
    image::ImageEncoder::write_image(
        encoder,
        image.as_raw(),
        image.width(),
        image.height(),
        image::ExtendedColorType::Rgba8,
    )?;
    Ok(buf)
}
