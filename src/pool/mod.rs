//! Bounded task queue and supervised worker pool.
//!
//! Each worker is a dedicated OS thread that keeps its execution context for its whole
//! life; tasks are never moved between workers once dequeued. A supervisor thread per
//! slot joins the worker and, when it died from a panic, waits the respawn delay and
//! starts a replacement in the same slot.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::cancel::CancelToken;
use crate::detect::{DetectionMap, Detector};
use crate::error::{DispatchError, Result};
use crate::frame::FramePayload;

pub const DEFAULT_RESPAWN_DELAY: Duration = Duration::from_secs(1);

/// One unit of detection work with its private reply channel.
pub struct DetectionTask {
    detector: Arc<Detector>,
    frame: FramePayload,
    reply: Sender<Result<DetectionMap>>,
}

impl DetectionTask {
    pub fn new(detector: Arc<Detector>, frame: FramePayload) -> (Self, TaskHandle) {
        let (reply, rx) = bounded(1);
        (
            Self {
                detector,
                frame,
                reply,
            },
            TaskHandle { rx },
        )
    }

    fn run(self) {
        let result = self
            .frame
            .into_image()
            .and_then(|image| self.detector.detect(&image));
        // the caller may have given up waiting
        let _ = self.reply.send(result);
    }
}

/// Caller side of a task's reply channel.
pub struct TaskHandle {
    rx: Receiver<Result<DetectionMap>>,
}

impl TaskHandle {
    /// Block until the worker replies. A worker that died mid-task yields `TaskLost`.
    pub fn wait(self) -> Result<DetectionMap> {
        self.rx.recv().map_err(|_| DispatchError::TaskLost)?
    }

    pub fn wait_timeout(self, timeout: Duration) -> Result<DetectionMap> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(DispatchError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(DispatchError::TaskLost),
        }
    }
}

/// FIFO queue of detection tasks bounded to the pool size.
pub struct TaskQueue {
    tx: Mutex<Option<Sender<DetectionTask>>>,
    rx: Receiver<DetectionTask>,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
            capacity,
        }
    }

    /// Enqueue, blocking while the queue is full.
    pub fn submit(&self, task: DetectionTask) -> Result<()> {
        let tx = self.sender()?;
        tx.send(task).map_err(|_| DispatchError::QueueClosed)
    }

    /// Enqueue without blocking. A full queue hands the task back.
    pub fn try_submit(&self, task: DetectionTask) -> std::result::Result<(), DetectionTask> {
        let tx = match self.sender() {
            Ok(tx) => tx,
            Err(_) => return Err(task),
        };
        match tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => Err(task),
        }
    }

    /// Stop accepting tasks. Queued tasks are still handed to workers.
    pub fn close(&self) {
        self.lock_tx().take();
    }

    pub fn is_closed(&self) -> bool {
        self.lock_tx().is_none()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn receiver(&self) -> Receiver<DetectionTask> {
        self.rx.clone()
    }

    // cloned out so a blocked submit never holds the lock
    fn sender(&self) -> Result<Sender<DetectionTask>> {
        self.lock_tx().clone().ok_or(DispatchError::QueueClosed)
    }

    fn lock_tx(&self) -> MutexGuard<'_, Option<Sender<DetectionTask>>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub workers: usize,
    pub respawn_delay: Duration,
}

impl PoolConfig {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            respawn_delay: DEFAULT_RESPAWN_DELAY,
        }
    }
}

#[derive(Default)]
struct PoolStats {
    active: AtomicUsize,
    restarts: AtomicUsize,
}

/// N persistent workers draining one `TaskQueue`.
pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    stats: Arc<PoolStats>,
    stop: CancelToken,
    supervisors: Vec<JoinHandle<()>>,
    size: usize,
}

impl WorkerPool {
    pub fn start(config: PoolConfig) -> anyhow::Result<Self> {
        let size = config.workers.max(1);
        let queue = Arc::new(TaskQueue::new(size));
        let stats = Arc::new(PoolStats::default());
        let stop = CancelToken::new();

        let mut supervisors = Vec::with_capacity(size);
        for slot in 0..size {
            let supervisor = Supervisor {
                slot,
                rx: queue.receiver(),
                stats: stats.clone(),
                stop: stop.clone(),
                respawn_delay: config.respawn_delay,
            };
            let handle = thread::Builder::new()
                .name(format!("detect-supervisor-{}", slot))
                .spawn(move || supervisor.run())?;
            supervisors.push(handle);
        }
        log::info!("worker pool started with {} workers", size);
        Ok(Self {
            queue,
            stats,
            stop,
            supervisors,
            size,
        })
    }

    /// Queue a detection against `detector`. Blocks while the queue is full.
    pub fn submit(&self, detector: Arc<Detector>, frame: FramePayload) -> Result<TaskHandle> {
        let (task, handle) = DetectionTask::new(detector, frame);
        self.queue.submit(task)?;
        Ok(handle)
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers currently alive and consuming.
    pub fn active_workers(&self) -> usize {
        self.stats.active.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> usize {
        self.stats.restarts.load(Ordering::SeqCst)
    }

    /// Close the queue, let workers drain what is already queued, and join them.
    pub fn shutdown(self) {
        self.queue.close();
        self.stop.cancel();
        for handle in self.supervisors {
            if handle.join().is_err() {
                log::error!("worker supervisor panicked during shutdown");
            }
        }
        log::info!("worker pool stopped");
    }
}

struct Supervisor {
    slot: usize,
    rx: Receiver<DetectionTask>,
    stats: Arc<PoolStats>,
    stop: CancelToken,
    respawn_delay: Duration,
}

impl Supervisor {
    fn run(self) {
        loop {
            let rx = self.rx.clone();
            let stats = self.stats.clone();
            let slot = self.slot;
            let spawned = thread::Builder::new()
                .name(format!("detect-worker-{}", slot))
                .spawn(move || worker_loop(slot, rx, stats));
            let worker = match spawned {
                Ok(worker) => worker,
                Err(err) => {
                    log::error!("failed to spawn worker {}: {}", slot, err);
                    if self.stop.wait(self.respawn_delay) {
                        return;
                    }
                    continue;
                }
            };

            match worker.join() {
                Ok(()) => return,
                Err(payload) => {
                    log::error!(
                        "worker {} crashed: {}; respawning in {:?}",
                        slot,
                        panic_message(payload.as_ref()),
                        self.respawn_delay
                    );
                    if self.stop.wait(self.respawn_delay) {
                        return;
                    }
                    self.stats.restarts.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }
}

struct ActiveGuard(Arc<PoolStats>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn worker_loop(slot: usize, rx: Receiver<DetectionTask>, stats: Arc<PoolStats>) {
    stats.active.fetch_add(1, Ordering::SeqCst);
    let _active = ActiveGuard(stats);
    log::debug!("worker {} consuming", slot);
    // ends once the queue is closed and drained
    while let Ok(task) = rx.recv() {
        task.run();
    }
    log::debug!("worker {} exiting", slot);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
