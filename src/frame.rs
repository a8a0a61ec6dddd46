//! Frame payloads handed to detectors.
//!
//! - `ImageData`: decoded pixels plus the metadata a backend needs (width, height, channels).
//! - `FramePayload`: what a caller submits. Either already-decoded pixels or an encoded
//!   image (JPEG/PNG) that the executing worker decodes.
//!
//! Pixels are interleaved, row-major, RGB order for decoded images.

use crate::error::{DispatchError, Result};

/// Upper bound on a single encoded frame accepted from a client.
pub const MAX_ENCODED_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Decoded image handed to a detection backend.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl ImageData {
    /// Build from raw interleaved pixels, checking the buffer matches the dimensions.
    pub fn new(bytes: Vec<u8>, width: u32, height: u32, channels: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(DispatchError::validation("image dimensions must be non-zero"));
        }
        if !(1..=4).contains(&channels) {
            return Err(DispatchError::validation(format!(
                "unsupported channel count {}",
                channels
            )));
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(channels as usize))
            .ok_or_else(|| DispatchError::validation("image dimensions overflow"))?;
        if bytes.len() != expected {
            return Err(DispatchError::validation(format!(
                "expected {} pixel bytes for {}x{}x{}, received {}",
                expected,
                width,
                height,
                channels,
                bytes.len()
            )));
        }
        Ok(Self {
            bytes,
            width,
            height,
            channels,
        })
    }

    /// Decode an encoded image (JPEG or PNG) into 3-channel RGB.
    pub fn decode(encoded: &[u8]) -> Result<Self> {
        if encoded.is_empty() {
            return Err(DispatchError::Decode("empty image payload".to_string()));
        }
        if encoded.len() > MAX_ENCODED_FRAME_BYTES {
            return Err(DispatchError::Decode(format!(
                "encoded image exceeds {} bytes",
                MAX_ENCODED_FRAME_BYTES
            )));
        }
        let decoded = image::load_from_memory(encoded)
            .map_err(|e| DispatchError::Decode(e.to_string()))?
            .to_rgb8();
        let (width, height) = decoded.dimensions();
        if width == 0 || height == 0 {
            return Err(DispatchError::Decode(
                "decoded image is empty or unsupported format".to_string(),
            ));
        }
        Ok(Self {
            bytes: decoded.into_raw(),
            width,
            height,
            channels: 3,
        })
    }
}

/// Frame as submitted by a caller.
#[derive(Clone, Debug)]
pub enum FramePayload {
    Raw(ImageData),
    Encoded(Vec<u8>),
}

impl FramePayload {
    /// Produce decoded pixels, decoding on the calling thread if needed.
    pub fn into_image(self) -> Result<ImageData> {
        match self {
            FramePayload::Raw(image) => Ok(image),
            FramePayload::Encoded(bytes) => ImageData::decode(&bytes),
        }
    }
}

impl From<ImageData> for FramePayload {
    fn from(image: ImageData) -> Self {
        FramePayload::Raw(image)
    }
}
