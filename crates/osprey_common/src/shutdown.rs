//! Interruptible shutdown signal and poll helper for background work.
//!
//! Every fixed-interval polling loop in the subsystem (read-lock
//! confirmation, leader-readiness checks) waits through this signal
//! instead of a bare `thread::sleep`, so a stop request wakes the loop
//! within milliseconds and tests can run the same code with millisecond
//! intervals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A cooperative shutdown signal backed by `Condvar`.
///
/// When `shutdown()` is called, any thread blocked in `wait_timeout()`
/// is woken immediately.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    flag: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

/// Result of a bounded poll loop (`ShutdownSignal::poll_until`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The condition was met.
    Ready(T),
    /// The attempt budget ran out.
    Exhausted,
    /// Shutdown was requested while waiting.
    Interrupted,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownInner {
                flag: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Signal shutdown. Wakes all waiters immediately.
    pub fn shutdown(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
    }

    /// Check if shutdown has been requested (non-blocking).
    pub fn is_shutdown(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Sleep for at most `duration`, waking immediately on `shutdown()`.
    /// Returns `true` if shutdown was requested (caller should exit).
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        if self.is_shutdown() {
            return true;
        }
        let guard = self.inner.mutex.lock().unwrap_or_else(|e| e.into_inner());
        let (_guard, _timeout) = self
            .inner
            .condvar
            .wait_timeout(guard, duration)
            .unwrap_or_else(|e| e.into_inner());
        self.is_shutdown()
    }

    /// Run `check` up to `attempts` times, waiting `interval` between
    /// attempts. The first attempt runs immediately. The wait is
    /// interruptible: a shutdown request ends the loop right away.
    pub fn poll_until<T>(
        &self,
        attempts: u32,
        interval: Duration,
        mut check: impl FnMut() -> Option<T>,
    ) -> PollOutcome<T> {
        for attempt in 0..attempts {
            if self.is_shutdown() {
                return PollOutcome::Interrupted;
            }
            if let Some(value) = check() {
                return PollOutcome::Ready(value);
            }
            if attempt + 1 < attempts && self.wait_timeout(interval) {
                return PollOutcome::Interrupted;
            }
        }
        PollOutcome::Exhausted
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
