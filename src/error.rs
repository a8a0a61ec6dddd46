use thiserror::Error;

/// Why a detector refused an operation in its current lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("Detector not registered")]
    NotRegistered,
    #[error("Model not loaded")]
    ModelNotLoaded,
    #[error("Detector is busy")]
    Busy,
    #[error("Detector faulted and must be destroyed")]
    Faulted,
}

/// Error taxonomy shared by the registry, the worker pool and the session manager.
///
/// Validation and not-found errors are raised before any state is touched.
/// `TaskLost` is what a caller sees when the worker running its task crashed.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error(transparent)]
    State(#[from] StateError),
    #[error("detection failed: {0}")]
    NativeFailure(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("backend allocation failed: {0}")]
    Allocation(String),
    #[error("task lost: worker terminated before replying")]
    TaskLost,
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("task queue closed")]
    QueueClosed,
    #[error("no idle session worker available")]
    NoCapacity,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl DispatchError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn detector_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: "detector",
            id: id.to_string(),
        }
    }

    pub fn session_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: "session",
            id: id.to_string(),
        }
    }

    /// HTTP status used by the request layer for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::Decode(_) => 400,
            Self::NotFound { .. } => 404,
            Self::State(_) => 409,
            Self::NoCapacity | Self::QueueClosed => 503,
            Self::Timeout(_) | Self::TaskLost => 504,
            Self::NativeFailure(_)
            | Self::Allocation(_)
            | Self::Transport(_)
            | Self::Storage(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
