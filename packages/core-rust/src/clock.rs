//! Wall-clock abstraction used by the scheduler and queue drivers.
//!
//! Everything that compares against "now" takes a [`Clock`] so tests can
//! substitute virtual time. [`SystemClock`] reads the real time;
//! [`TokioClock`] follows `tokio::time`, so a paused runtime
//! (`tokio::time::pause`) drives it deterministically.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Default clock that reads the real system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock anchored to a wall-clock instant that advances with `tokio::time`.
///
/// Under `tokio::time::pause()` the clock only moves when the runtime
/// auto-advances or a test calls `tokio::time::advance`, which keeps timer
/// firing and "now" consistent with each other.
#[derive(Debug, Clone)]
pub struct TokioClock {
    anchor_wall: DateTime<Utc>,
    anchor_instant: tokio::time::Instant,
}

impl TokioClock {
    /// Creates a clock that reads `start` at the current tokio instant.
    #[must_use]
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            anchor_wall: start,
            anchor_instant: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::starting_at(Utc::now())
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now().duration_since(self.anchor_instant);
        self.anchor_wall + TimeDelta::from_std(elapsed).unwrap_or(TimeDelta::MAX)
    }
}

/// Manually stepped clock for fully synchronous tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: std::time::Duration) {
        let mut now = self.now.lock();
        *now += TimeDelta::from_std(delta).unwrap_or(TimeDelta::zero());
    }

    /// Sets the clock to an absolute time.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Returns the default shared system clock.
#[must_use]
pub fn system() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn manual_clock_advances() {
        let start = DateTime::<Utc>::from_timestamp(1_000, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now().timestamp(), 1_005);
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let start = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        let a = ManualClock::new(start);
        let b = a.clone();
        a.advance(Duration::from_millis(1500));
        assert_eq!(b.now().timestamp_millis(), 1500);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_paused_time() {
        let start = DateTime::<Utc>::from_timestamp(10, 0).unwrap();
        let clock = TokioClock::starting_at(start);
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(clock.now().timestamp_millis(), 10_250);
    }
}
