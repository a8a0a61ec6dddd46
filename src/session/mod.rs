//! Exclusive streaming sessions.
//!
//! A session claims one session worker for its whole lifetime, bypassing the shared task
//! queue. Session workers are a dedicated set of detectors registered with the manager;
//! they are never handed to the worker pool. Every session gets an idle monitor thread
//! that releases it once no frame has arrived for the idle timeout.

pub mod tcp;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use rand::RngCore;
use serde::Serialize;

use crate::cancel::CancelToken;
use crate::detect::{DetectionMap, Detector, DetectorState};
use crate::error::{DispatchError, Result};
use crate::frame::FramePayload;

pub use tcp::{StreamHandle, StreamListener, TcpTransport};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outbound message on a session transport.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SessionMessage {
    Result {
        #[serde(rename = "sessionId")]
        session_id: String,
        detections: DetectionMap,
    },
    Error {
        #[serde(rename = "sessionId")]
        session_id: String,
        message: String,
    },
}

/// Connection owned by a session.
///
/// `close` may be called more than once by the transport's own reader; the manager calls
/// it exactly once per session.
pub trait SessionTransport: Send + Sync {
    fn send(&self, message: &SessionMessage) -> anyhow::Result<()>;
    fn close(&self);
}

#[derive(Clone, Copy, Debug)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Identifiers handed back by a successful allocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionLease {
    pub session_id: String,
    pub worker_id: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerSlotState {
    Idle,
    Busy,
}

struct SessionWorker {
    id: usize,
    detector: Arc<Detector>,
    state: Mutex<WorkerSlotState>,
}

impl SessionWorker {
    /// IDLE -> BUSY under the slot lock. Faulted detectors are never handed out.
    fn try_claim(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != WorkerSlotState::Idle || self.detector.state() != DetectorState::Idle {
            return false;
        }
        *state = WorkerSlotState::Busy;
        true
    }

    fn set_idle(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = WorkerSlotState::Idle;
    }

    fn slot_state(&self) -> WorkerSlotState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Session {
    id: String,
    worker: Arc<SessionWorker>,
    last_active: Mutex<Instant>,
    transport: Arc<dyn SessionTransport>,
    idle_timer: CancelToken,
}

impl Session {
    fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

struct ManagerInner {
    settings: SessionSettings,
    workers: RwLock<Vec<Arc<SessionWorker>>>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

/// Allocator of exclusive session workers. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                settings,
                workers: RwLock::new(Vec::new()),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn settings(&self) -> SessionSettings {
        self.inner.settings
    }

    /// Register a loaded detector as a session worker. Returns its worker id.
    pub fn add_worker(&self, detector: Arc<Detector>) -> usize {
        let mut workers = self
            .inner
            .workers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let id = workers.len();
        workers.push(Arc::new(SessionWorker {
            id,
            detector,
            state: Mutex::new(WorkerSlotState::Idle),
        }));
        id
    }

    pub fn worker_count(&self) -> usize {
        self.inner
            .workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn worker_states(&self) -> Vec<WorkerSlotState> {
        self.inner
            .workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|w| w.slot_state())
            .collect()
    }

    /// Claim an idle worker for a new session and start its idle monitor.
    pub fn allocate(&self, transport: Arc<dyn SessionTransport>) -> Result<SessionLease> {
        let worker = {
            let workers = self
                .inner
                .workers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            workers.iter().find(|w| w.try_claim()).cloned()
        }
        .ok_or(DispatchError::NoCapacity)?;

        let session = Arc::new(Session {
            id: new_session_id(),
            worker: worker.clone(),
            last_active: Mutex::new(Instant::now()),
            transport,
            idle_timer: CancelToken::new(),
        });
        let lease = SessionLease {
            session_id: session.id.clone(),
            worker_id: worker.id,
        };
        self.lock_sessions()
            .insert(session.id.clone(), session.clone());

        let manager = self.clone();
        let monitored = session.clone();
        let spawned = thread::Builder::new()
            .name(format!("session-idle-{}", &session.id[..8]))
            .spawn(move || manager.watch_idle(&monitored));
        if let Err(err) = spawned {
            log::error!("failed to start idle monitor: {}", err);
            self.release(&lease.session_id);
            return Err(DispatchError::Allocation(err.to_string()));
        }
        log::info!(
            "session {} allocated worker {}",
            lease.session_id,
            lease.worker_id
        );
        Ok(lease)
    }

    /// Remove the session, close its transport, stop its idle monitor and free its worker.
    ///
    /// Returns false when the session was already released.
    pub fn release(&self, session_id: &str) -> bool {
        let session = match self.lock_sessions().remove(session_id) {
            Some(session) => session,
            None => return false,
        };
        session.idle_timer.cancel();
        session.transport.close();
        session.worker.set_idle();
        log::info!(
            "session {} released worker {}",
            session_id,
            session.worker.id
        );
        true
    }

    /// Release every open session. Used during shutdown.
    pub fn release_all(&self) -> usize {
        let ids: Vec<String> = self.lock_sessions().keys().cloned().collect();
        ids.iter().filter(|id| self.release(id)).count()
    }

    /// Run one inbound frame against the session's worker and reply on its transport.
    ///
    /// Decode and detection failures are reported inline and keep the session open. A
    /// failed send is treated as a disconnect.
    pub fn handle_frame(&self, session_id: &str, frame: FramePayload) -> Result<()> {
        let session = self
            .lock_sessions()
            .get(session_id)
            .cloned()
            .ok_or_else(|| DispatchError::session_not_found(session_id))?;
        session.touch();

        let detector = session.worker.detector.clone();
        let outcome = catch_unwind(AssertUnwindSafe(move || {
            frame
                .into_image()
                .and_then(|image| detector.detect(&image))
        }));
        session.touch();

        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                log::error!(
                    "session {} worker {} panicked; closing session",
                    session_id,
                    session.worker.id
                );
                self.release(session_id);
                return Err(DispatchError::NativeFailure(
                    "session worker panicked".to_string(),
                ));
            }
        };
        let message = match result {
            Ok(detections) => SessionMessage::Result {
                session_id: session_id.to_string(),
                detections,
            },
            Err(err) => {
                log::debug!("session {} frame failed: {}", session_id, err);
                SessionMessage::Error {
                    session_id: session_id.to_string(),
                    message: err.to_string(),
                }
            }
        };

        if let Err(err) = session.transport.send(&message) {
            log::warn!("session {} transport failed: {:#}", session_id, err);
            self.release(session_id);
            return Err(DispatchError::Transport(format!("{:#}", err)));
        }
        Ok(())
    }

    pub fn active_sessions(&self) -> usize {
        self.lock_sessions().len()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock_sessions().contains_key(session_id)
    }

    fn watch_idle(&self, session: &Session) {
        let settings = self.inner.settings;
        loop {
            if session.idle_timer.wait(settings.poll_interval) {
                return;
            }
            if session.idle_for() > settings.idle_timeout {
                if self.release(&session.id) {
                    log::info!(
                        "session {} evicted after {:?} idle",
                        session.id,
                        settings.idle_timeout
                    );
                }
                return;
            }
        }
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
