//! Synchronization primitives for the worker pool.
//!
//! Provides a manual-reset event workers sleep on and a cancellation token
//! tasks poll.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A manual-reset event: once set, every waiter passes until it is reset.
#[derive(Debug, Default)]
pub struct ManualEvent {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl ManualEvent {
    #[must_use]
    pub fn new(initially_set: bool) -> Self {
        ManualEvent {
            signalled: Mutex::new(initially_set),
            cond: Condvar::new(),
        }
    }

    /// Set the event and wake all waiters.
    pub fn set(&self) {
        let mut signalled = self.signalled.lock();
        if !*signalled {
            *signalled = true;
            self.cond.notify_all();
        }
    }

    pub fn reset(&self) {
        *self.signalled.lock() = false;
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.signalled.lock()
    }

    /// Block until the event is set.
    pub fn wait(&self) {
        let mut signalled = self.signalled.lock();
        while !*signalled {
            self.cond.wait(&mut signalled);
        }
    }

    /// Block until the event is set or `timeout` passes. Returns whether it was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signalled = self.signalled.lock();
        if !*signalled {
            self.cond.wait_for(&mut signalled, timeout);
        }
        *signalled
    }
}

/// A shared cancellation flag for one batch of tasks.
///
/// Wraps `Arc<AtomicBool>`; clones observe the same flag.
#[derive(Clone, Debug)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token (initially not cancelled).
    #[must_use]
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Clear the flag for the next batch.
    #[inline]
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
