use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::backend::{DetectionBackend, SharedFactory};

pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::StubBackend;

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;

/// Names accepted by `factory_for` in this build.
pub fn available() -> Vec<&'static str> {
    let mut names = vec!["stub"];
    if cfg!(feature = "backend-tract") {
        names.push("tract");
    }
    names
}

/// Resolve a configured backend name to a factory producing fresh instances.
pub fn factory_for(name: &str) -> Result<SharedFactory> {
    match name.trim().to_ascii_lowercase().as_str() {
        "stub" => Ok(stub_factory()),
        #[cfg(feature = "backend-tract")]
        "tract" | "onnx" => Ok(Arc::new(|| -> Result<Box<dyn DetectionBackend>> {
            Ok(Box::new(TractBackend::new()))
        })),
        other => Err(anyhow!(
            "unsupported inference backend '{}'; available: {}",
            other,
            available().join(", ")
        )),
    }
}

pub fn stub_factory() -> SharedFactory {
    Arc::new(|| -> Result<Box<dyn DetectionBackend>> { Ok(Box::new(StubBackend::new())) })
}
