//! One-shot completion barrier for audio preroll.
//!
//! The playout scheduler's construction thread waits here while the device's
//! audio callback drains the silent preroll packet. The callback signals once
//! the packet is fully accepted; the waiter gives up after a bounded timeout.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Condvar, Mutex,
    },
    time::{Duration, Instant},
};

use crate::{Error, Result};

/// Default upper bound on how long preroll may take before construction fails.
pub const DEFAULT_PREROLL_TIMEOUT: Duration = Duration::from_secs(5);

/// A signal-once, wait-many barrier.
///
/// Locks are recovered if poisoned; a panicking callback thread must not turn
/// into a second panic on the construction thread.
///
/// # Example
///
/// ```
/// use std::{sync::Arc, thread, time::Duration};
/// use replay_pipeline::preroll::PrerollSignal;
///
/// let signal = Arc::new(PrerollSignal::new());
/// let remote = Arc::clone(&signal);
/// thread::spawn(move || remote.signal());
/// signal.wait_timeout(Duration::from_secs(1))?;
/// assert!(signal.is_complete());
/// # Ok::<(), replay_pipeline::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct PrerollSignal {
    completed: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
}

impl PrerollSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks preroll complete and wakes every waiter.
    ///
    /// Returns true only for the call that performed the transition.
    pub fn signal(&self) -> bool {
        let first = !self.completed.swap(true, Ordering::AcqRel);
        let _lock = self
            .lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.cv.notify_all();
        first
    }

    /// Lock-free completion check.
    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Blocks until [`signal`](Self::signal) or until `timeout` elapses.
    ///
    /// # Errors
    ///
    /// [`Error::PrerollTimeout`] if the signal did not arrive in time.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        let mut guard = self
            .lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let start = Instant::now();

        while !self.completed.load(Ordering::Acquire) {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                tracing::warn!(?timeout, "audio preroll did not complete");
                return Err(Error::PrerollTimeout(timeout));
            }

            guard = match self.cv.wait_timeout(guard, timeout - elapsed) {
                Ok((new_guard, _)) => new_guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        tracing::debug!(elapsed = ?start.elapsed(), "audio preroll complete");
        Ok(())
    }
}
