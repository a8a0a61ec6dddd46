mod backend;
pub mod backends;
mod detector;
mod names;
mod registry;
mod result;

pub use backend::{BackendFactory, DetectionBackend, ModelSpec, RawDetection, SharedFactory};
pub use backends::{factory_for, stub_factory, StubBackend};
pub use detector::{Detector, DetectorConfig, DetectorState, LoadParams};
pub use names::NameSource;
pub(crate) use registry::new_id;
pub use registry::{DetectorEntry, DetectorInfo, DetectorRegistry, EngineType};
pub use result::{group_by_class, DetectionBox, DetectionMap, Position, Quad};
