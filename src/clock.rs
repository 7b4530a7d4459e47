// src/clock.rs

//! Injectable monotonic time sources.
//!
//! The scheduler never reads the system clock directly. `Coroutine::wait`,
//! debounced triggers and runtime telemetry all go through a [`Clock`], so
//! tests can swap in a [`ManualClock`] and advance time between ticks without
//! sleeping.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A monotonic time provider with microsecond resolution.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Microseconds elapsed since an arbitrary, fixed origin.
    fn now_micros(&self) -> u64;
}

/// Wall-clock backed implementation used in production.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_micros(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying time, so a test can hand one clone to the
/// scheduler and keep another to drive it.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jump to an absolute time since the clock's origin.
    pub fn set(&self, since_origin: Duration) {
        self.micros.store(duration_to_micros(since_origin), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.micros
            .fetch_add(duration_to_micros(by), Ordering::SeqCst);
    }

    pub fn now(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::SeqCst))
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.micros.load(Ordering::SeqCst)
    }
}

/// Shared handle type the scheduler stores.
pub type SharedClock = Arc<dyn Clock>;

pub(crate) fn duration_to_micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new();
        let observer = clock.clone();

        clock.set(Duration::from_millis(3));
        clock.advance(Duration::from_micros(250));

        assert_eq!(observer.now_micros(), 3_250);
        assert_eq!(observer.now(), Duration::from_micros(3_250));
    }

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let clock = MonotonicClock::new();
        let first = clock.now_micros();
        let second = clock.now_micros();
        assert!(second >= first);
    }
}
