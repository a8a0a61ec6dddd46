//! Detection dispatch core
//!
//! Serves object-detection requests against loaded detector instances, spreading the
//! work over a bounded pool of dedicated worker threads.
//!
//! # Architecture
//!
//! - **Detector registry**: detector records keyed by opaque ids, each owning one
//!   backend instance and an explicit lifecycle (`Unregistered -> Registered -> Idle <-> Busy`,
//!   plus `Error`). A backend never runs two detections at once.
//! - **Task queue and worker pool**: a FIFO queue bounded to the pool size feeds N
//!   worker threads. Submitters block when the queue is full. A worker that panics is
//!   respawned in its slot after a fixed delay, and the caller of the lost task sees
//!   `DispatchError::TaskLost`.
//! - **Session manager**: exclusive workers for streaming clients, outside the shared
//!   queue, with idle-timeout eviction and idempotent release.
//! - **Heartbeat**: periodic registration with an external instance registry.
//! - **Process monitor**: memory and CPU gauges plus a request counter on `/metrics`.
//!
//! # Module Structure
//!
//! - `detect`: backend contract, detector state machine, registry, backends
//! - `pool`: task queue and supervised workers
//! - `session`: session allocation, idle monitor, TCP stream transport
//! - `heartbeat`, `monitor`: background loops, stopped through `CancelToken`
//! - `api`, `http`: JSON request layer
//! - `config`, `server`: daemon configuration and wiring

pub mod api;
pub mod cancel;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod http;
pub mod monitor;
pub mod pool;
pub mod server;
pub mod session;

pub use cancel::CancelToken;
pub use config::DetectdConfig;
pub use detect::{
    DetectionBackend, DetectionMap, Detector, DetectorRegistry, DetectorState, EngineType,
    LoadParams, NameSource,
};
pub use error::{DispatchError, Result, StateError};
pub use frame::{FramePayload, ImageData};
pub use heartbeat::{HeartbeatClient, InstanceClass};
pub use monitor::{Metrics, ProcessMonitor};
pub use pool::{TaskHandle, TaskQueue, WorkerPool};
pub use server::{DetectionServer, ServerHandle};
pub use session::{SessionManager, SessionTransport};
