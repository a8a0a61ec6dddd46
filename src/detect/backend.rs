use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::frame::ImageData;

/// Parameters handed to a backend when a model is loaded.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelSpec {
    pub model_path: String,
    pub conf: f32,
    pub iou: f32,
    pub use_gpu: bool,
    /// Number of class names the detector resolved; backends use it to size their heads.
    pub class_count: usize,
}

/// One raw detection as produced by a backend.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    /// Corner box `[x1, y1, x2, y2]` in image pixels.
    pub bbox: [f32; 4],
    pub score: f32,
    pub class_id: usize,
}

/// Detection capability contract.
///
/// # Execution context
///
/// A backend instance is owned by exactly one detector and is only ever called by one
/// thread at a time. Implementations may keep thread-local or context-local state
/// between calls; the dispatch layer never runs two calls on one instance concurrently.
pub trait DetectionBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Load (or reload) a model. Must fail rather than leave a half-loaded model usable.
    fn load_model(&mut self, spec: &ModelSpec) -> Result<()>;

    /// Run detection on a decoded image.
    fn detect(&mut self, image: &ImageData) -> Result<Vec<RawDetection>>;

    /// Release native resources. Called once, before the backend is dropped.
    fn destroy(&mut self) {}

    /// Optional: override the network input size.
    fn set_input_size(&mut self, _size: u32) -> Result<()> {
        Err(anyhow!("backend '{}' does not support input size overrides", self.name()))
    }

    /// Optional: override the network input/output blob names.
    fn set_blob_name(&mut self, _input: &str, _output: &str) -> Result<()> {
        Err(anyhow!("backend '{}' does not support blob names", self.name()))
    }
}

/// Allocates fresh backend instances for new detectors.
pub trait BackendFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn DetectionBackend>>;
}

impl<F> BackendFactory for F
where
    F: Fn() -> Result<Box<dyn DetectionBackend>> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn DetectionBackend>> {
        self()
    }
}

pub type SharedFactory = Arc<dyn BackendFactory>;
