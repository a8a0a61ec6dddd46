use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};

use crate::detect::backend::{DetectionBackend, ModelSpec, RawDetection};
use crate::frame::ImageData;

/// Deterministic backend for development and tests.
///
/// Detections are derived from a SHA-256 of the pixels, so the same frame always
/// yields the same boxes. No model file is read.
#[derive(Default)]
pub struct StubBackend {
    spec: Option<ModelSpec>,
    input_size: Option<u32>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Input size override, if one was set. Boxes do not depend on it.
    pub fn input_size(&self) -> Option<u32> {
        self.input_size
    }
}

impl DetectionBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn load_model(&mut self, spec: &ModelSpec) -> Result<()> {
        if spec.class_count == 0 {
            return Err(anyhow!("stub backend needs at least one class"));
        }
        self.spec = Some(spec.clone());
        Ok(())
    }

    fn detect(&mut self, image: &ImageData) -> Result<Vec<RawDetection>> {
        let spec = self
            .spec
            .as_ref()
            .ok_or_else(|| anyhow!("stub backend has no model loaded"))?;
        if image.bytes.is_empty() {
            return Err(anyhow!("empty frame"));
        }
        let digest: [u8; 32] = Sha256::digest(&image.bytes).into();

        let width = image.width as f32;
        let height = image.height as f32;
        let count = (digest[0] % 4) as usize;
        let mut detections = Vec::with_capacity(count);
        for chunk in digest[1..].chunks_exact(6).take(count) {
            let score = 0.25 + (chunk[0] as f32 / 255.0) * 0.75;
            if score < spec.conf {
                continue;
            }
            let x1 = chunk[1] as f32 / 255.0 * width * 0.5;
            let y1 = chunk[2] as f32 / 255.0 * height * 0.5;
            let x2 = x1 + (1.0 + chunk[3] as f32 / 255.0 * width * 0.5);
            let y2 = y1 + (1.0 + chunk[4] as f32 / 255.0 * height * 0.5);
            detections.push(RawDetection {
                bbox: [x1, y1, x2.min(width), y2.min(height)],
                score,
                class_id: chunk[5] as usize % spec.class_count,
            });
        }
        Ok(detections)
    }

    fn destroy(&mut self) {
        self.spec = None;
    }

    fn set_input_size(&mut self, size: u32) -> Result<()> {
        if size == 0 {
            return Err(anyhow!("input size must be positive"));
        }
        log::debug!("stub backend input size {:?} -> {}", self.input_size, size);
        self.input_size = Some(size);
        Ok(())
    }
}
