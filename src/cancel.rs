use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

/// Cancellation signal for the background loops.
///
/// Clones share the same signal. Cancelling drops the only sender, which wakes
/// every waiter immediately instead of at the end of its current sleep.
#[derive(Clone, Debug)]
pub struct CancelToken {
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    signal: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            trigger: Arc::new(Mutex::new(Some(tx))),
            signal: rx,
        }
    }

    /// Fire the signal. Returns true only for the call that actually fired it.
    pub fn cancel(&self) -> bool {
        self.trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Sleep for `timeout` or until cancelled. Returns true when cancelled.
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.signal.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn cancel_fires_once_and_wakes_waiters() {
        let token = CancelToken::new();
        assert!(!token.wait(Duration::from_millis(10)));

        let waiter = token.clone();
        let join = std::thread::spawn(move || {
            let started = Instant::now();
            let cancelled = waiter.wait(Duration::from_secs(10));
            (cancelled, started.elapsed())
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(token.cancel());
        assert!(!token.cancel());

        let (cancelled, elapsed) = join.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(2));
        assert!(token.is_cancelled());
        assert!(token.wait(Duration::from_secs(10)));
    }
}
