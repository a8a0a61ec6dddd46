use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use super::backend::{BackendFactory, DetectionBackend, ModelSpec};
use super::names::NameSource;
use super::result::{group_by_class, DetectionMap};
use crate::error::{DispatchError, Result, StateError};
use crate::frame::ImageData;

/// Lifecycle of a detector record.
///
/// `Unregistered -> Registered -> Idle <-> Busy`, with `Error` reached when a detection
/// call faults, and any state returning to `Unregistered` through `destroy`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectorState {
    Unregistered,
    Registered,
    Idle,
    Busy,
    Error,
}

/// Model parameters requested by a caller.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadParams {
    pub model_path: String,
    pub names: NameSource,
    pub conf: f32,
    pub iou: f32,
    pub use_gpu: bool,
}

impl LoadParams {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.conf) {
            return Err(DispatchError::validation(format!(
                "confidence must be between 0.0 and 1.0, got {}",
                self.conf
            )));
        }
        if !(0.0..=1.0).contains(&self.iou) {
            return Err(DispatchError::validation(format!(
                "IoU must be between 0.0 and 1.0, got {}",
                self.iou
            )));
        }
        if self.model_path.trim().is_empty() {
            return Err(DispatchError::validation("model path cannot be empty"));
        }
        Ok(())
    }
}

/// Current parameters of a detector, as reported by `check_config`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorConfig {
    pub model_path: String,
    pub names: Vec<String>,
    pub conf: f32,
    pub iou: f32,
    #[serde(rename = "useGPU")]
    pub use_gpu: bool,
}

struct DetectorInner {
    state: DetectorState,
    config: DetectorConfig,
    error_message: Option<String>,
}

/// A detector record: one exclusively-owned backend plus its configuration and state.
///
/// The state lives behind its own lock so the BUSY check-and-set never waits on a
/// native call. The backend lock is only contended by `destroy` and model reloads,
/// which is what makes `destroy` wait for an in-flight detection.
pub struct Detector {
    inner: Mutex<DetectorInner>,
    backend: Mutex<Option<Box<dyn DetectionBackend>>>,
}

impl Detector {
    /// Allocate a fresh backend. The new record starts REGISTERED.
    pub fn new(factory: &dyn BackendFactory) -> Result<Self> {
        let backend = factory
            .create()
            .map_err(|e| DispatchError::Allocation(format!("{:#}", e)))?;
        Ok(Self::with_backend(backend))
    }

    pub fn with_backend(backend: Box<dyn DetectionBackend>) -> Self {
        Self {
            inner: Mutex::new(DetectorInner {
                state: DetectorState::Registered,
                config: DetectorConfig::default(),
                error_message: None,
            }),
            backend: Mutex::new(Some(backend)),
        }
    }

    pub fn state(&self) -> DetectorState {
        self.lock_inner().state
    }

    pub fn error_message(&self) -> Option<String> {
        self.lock_inner().error_message.clone()
    }

    pub fn check_config(&self) -> DetectorConfig {
        self.lock_inner().config.clone()
    }

    /// Validate parameters, resolve class names, then load the model into the backend.
    ///
    /// Nothing is mutated when validation fails. A backend failure leaves the record
    /// REGISTERED so it can be retried or destroyed.
    pub fn load_model(&self, params: &LoadParams) -> Result<()> {
        params.validate()?;
        let names = params.names.resolve()?;

        let reloading = {
            let mut inner = self.lock_inner();
            match inner.state {
                DetectorState::Registered => false,
                DetectorState::Idle => {
                    inner.state = DetectorState::Busy;
                    true
                }
                other => return Err(refusal(other).into()),
            }
        };

        let spec = ModelSpec {
            model_path: params.model_path.clone(),
            conf: params.conf,
            iou: params.iou,
            use_gpu: params.use_gpu,
            class_count: names.len(),
        };
        // held until the state is settled; destroy takes backend then inner too
        let mut backend = self.lock_backend();
        let outcome = match backend.as_mut() {
            Some(backend) => backend
                .load_model(&spec)
                .map_err(|e| DispatchError::NativeFailure(format!("{:#}", e))),
            None => Err(StateError::NotRegistered.into()),
        };

        let mut inner = self.lock_inner();
        let destroyed = inner.state == DetectorState::Unregistered
            || (reloading && inner.state != DetectorState::Busy);
        if destroyed || backend.is_none() {
            return Err(StateError::NotRegistered.into());
        }
        match outcome {
            Ok(()) => {
                inner.config = DetectorConfig {
                    model_path: params.model_path.clone(),
                    names,
                    conf: params.conf,
                    iou: params.iou,
                    use_gpu: params.use_gpu,
                };
                inner.state = DetectorState::Idle;
                inner.error_message = None;
                Ok(())
            }
            Err(err) => {
                inner.state = DetectorState::Registered;
                inner.error_message = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Run one detection. Rejected immediately unless the record is IDLE.
    ///
    /// A backend failure is reported as `NativeFailure` and the record returns to IDLE.
    pub fn detect(&self, image: &ImageData) -> Result<DetectionMap> {
        let names = {
            let mut inner = self.lock_inner();
            match inner.state {
                DetectorState::Idle => {}
                other => return Err(refusal(other).into()),
            }
            inner.state = DetectorState::Busy;
            inner.config.names.clone()
        };
        let _busy = BusyGuard { detector: self };

        let mut backend = self.lock_backend();
        let backend = backend.as_mut().ok_or(StateError::NotRegistered)?;
        let raw = backend
            .detect(image)
            .map_err(|e| DispatchError::NativeFailure(format!("{:#}", e)))?;
        Ok(group_by_class(&names, &raw))
    }

    /// Release the backend and reset every field. Safe to call repeatedly.
    ///
    /// Blocks until an in-flight detection on this record has returned.
    pub fn destroy(&self) {
        let backend = self.lock_backend().take();
        if let Some(mut backend) = backend {
            backend.destroy();
        }
        let mut inner = self.lock_inner();
        inner.state = DetectorState::Unregistered;
        inner.config = DetectorConfig::default();
        inner.error_message = None;
    }

    pub fn set_input_size(&self, size: u32) -> Result<()> {
        self.configure(|backend| backend.set_input_size(size))
    }

    pub fn set_blob_name(&self, input: &str, output: &str) -> Result<()> {
        self.configure(|backend| backend.set_blob_name(input, output))
    }

    fn configure<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut dyn DetectionBackend) -> anyhow::Result<()>,
    {
        match self.state() {
            DetectorState::Registered | DetectorState::Idle => {}
            other => return Err(refusal(other).into()),
        }
        let mut backend = self.lock_backend();
        let backend = backend.as_mut().ok_or(StateError::NotRegistered)?;
        f(backend.as_mut()).map_err(|e| DispatchError::NativeFailure(format!("{:#}", e)))
    }

    fn lock_inner(&self) -> MutexGuard<'_, DetectorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_backend(&self) -> MutexGuard<'_, Option<Box<dyn DetectionBackend>>> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Detector {
    fn drop(&mut self) {
        let backend = self
            .backend
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut backend) = backend {
            backend.destroy();
        }
    }
}

fn refusal(state: DetectorState) -> StateError {
    match state {
        DetectorState::Unregistered => StateError::NotRegistered,
        DetectorState::Registered => StateError::ModelNotLoaded,
        DetectorState::Busy => StateError::Busy,
        DetectorState::Error | DetectorState::Idle => StateError::Faulted,
    }
}

/// Returns a BUSY record to IDLE when the detection call ends, or to ERROR when it
/// unwinds. A record destroyed meanwhile is left UNREGISTERED.
struct BusyGuard<'a> {
    detector: &'a Detector,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.detector.lock_inner();
        if inner.state != DetectorState::Busy {
            return;
        }
        if std::thread::panicking() {
            inner.state = DetectorState::Error;
            inner.error_message = Some("backend panicked during detection".to_string());
        } else {
            inner.state = DetectorState::Idle;
        }
    }
}
