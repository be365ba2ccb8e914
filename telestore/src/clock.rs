//! Time sources for record timestamps and age-based eviction.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the current time in seconds since the Unix epoch.
pub trait Clock: Debug + Send {
    /// Returns the current time.
    fn now(&self) -> f64;
}

/// Wall-clock time from [`SystemTime`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        // A clock set before 1970 reads as the epoch.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0.0, |elapsed| elapsed.as_secs_f64())
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same time, so a test can keep one clone and hand the
/// other to a [`Logger`](crate::Logger).
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    /// Bit pattern of the current `f64` time.
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock reading `start`.
    pub fn new(start: f64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start.to_bits())),
        }
    }

    /// Sets the current time.
    pub fn set(&self, now: f64) {
        self.now.store(now.to_bits(), Ordering::SeqCst);
    }

    /// Moves the clock forward by `seconds`.
    pub fn advance(&self, seconds: f64) {
        self.set(self.now() + seconds);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.now.load(Ordering::SeqCst))
    }
}
