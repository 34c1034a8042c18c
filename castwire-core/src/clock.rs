//! Monotonic pipeline clock
//!
//! Every captured unit is stamped with the time elapsed since the clock's
//! epoch, so video and audio share one timeline regardless of which thread
//! captured them. Built on `tokio::time::Instant` so tests can run it on paused
//! time.

use std::time::Duration;
use tokio::time::Instant;

/// Process-wide monotonic reference, shared by `Arc` between stages
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    /// Start a clock at the current instant
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Time elapsed since the epoch
    pub fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// The absolute instant a clock-relative offset corresponds to
    pub fn instant_at(&self, offset: Duration) -> Instant {
        self.epoch + offset
    }

    /// The clock's epoch
    pub fn epoch(&self) -> Instant {
        self.epoch
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::start()
    }
}
