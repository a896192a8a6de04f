//! Frame codec: base64 / data-URL decode, downscale, JPEG encode.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, RgbImage};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameCodecError {
    #[error("frame payload is empty")]
    Empty,

    #[error("invalid base64 frame: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("undecodable image: {0}")]
    Image(String),

    #[error("failed to encode frame: {0}")]
    Encode(String),
}

/// Decode a base64 image, accepting an optional `data:image/...;base64,` prefix.
pub fn decode_base64_frame(data: &str) -> Result<RgbImage, FrameCodecError> {
    let payload = match data.split_once(',') {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return Err(FrameCodecError::Empty);
    }

    let bytes = STANDARD.decode(payload)?;
    decode_frame(&bytes)
}

/// Decode encoded image bytes (JPEG or PNG) into RGB.
pub fn decode_frame(bytes: &[u8]) -> Result<RgbImage, FrameCodecError> {
    if bytes.is_empty() {
        return Err(FrameCodecError::Empty);
    }
    image::load_from_memory(bytes)
        .map(|decoded| decoded.to_rgb8())
        .map_err(|e| FrameCodecError::Image(e.to_string()))
}

/// Shrink to fit within `max_width x max_height`, keeping the aspect ratio.
/// Frames that already fit are returned untouched.
pub fn downscale(frame: RgbImage, max_width: u32, max_height: u32) -> RgbImage {
    let (width, height) = frame.dimensions();
    if width <= max_width && height <= max_height {
        return frame;
    }

    let scale = (max_width as f64 / width as f64).min(max_height as f64 / height as f64);
    let target_w = ((width as f64 * scale) as u32).max(1);
    let target_h = ((height as f64 * scale) as u32).max(1);
    imageops::resize(&frame, target_w, target_h, imageops::FilterType::Triangle)
}

/// Encode as baseline JPEG. `quality` is clamped to 1..=100.
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>, FrameCodecError> {
    let mut out = Vec::with_capacity((frame.width() * frame.height() / 4) as usize);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode_image(frame)
        .map_err(|e| FrameCodecError::Encode(e.to_string()))?;
    Ok(out)
}

pub fn encode_base64_jpeg(frame: &RgbImage, quality: u8) -> Result<String, FrameCodecError> {
    encode_jpeg(frame, quality).map(|jpeg| STANDARD.encode(jpeg))
}
