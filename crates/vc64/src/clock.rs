//! Host time abstraction.
//!
//! The scheduler paces frames against a monotonic nanosecond clock. Tests
//! inject [`ManualClock`] so pacing logic runs without wall-clock sleeps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Nanosecond clock the scheduler syncs against.
pub trait HostClock: Send {
    /// Monotonic time in nanoseconds.
    fn now(&self) -> u64;

    /// Block until `deadline` (nanoseconds on the same timeline). May
    /// return slightly early; callers spin on `now()` for the remainder.
    fn sleep_until(&self, deadline: u64);
}

/// Real clock over `std::time::Instant`.
pub struct MonotonicClock {
    epoch: Instant,
    /// Wake up this much before the deadline and busy-wait the rest, so
    /// the OS scheduler's wake-up granularity doesn't make frames late.
    early_wakeup_ns: u64,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            early_wakeup_ns: 1_500_000,
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for MonotonicClock {
    fn now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn sleep_until(&self, deadline: u64) {
        let now = self.now();
        if deadline > now + self.early_wakeup_ns {
            std::thread::sleep(Duration::from_nanos(deadline - now - self.early_wakeup_ns));
        }
        while self.now() < deadline {
            std::hint::spin_loop();
        }
    }
}

/// Test clock that only moves when told to (or when slept against).
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Advance the clock by `ns` nanoseconds.
    pub fn advance(&self, ns: u64) {
        self.now.fetch_add(ns, Ordering::SeqCst);
    }

    /// Set the absolute time.
    pub fn set(&self, ns: u64) {
        self.now.store(ns, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep_until(&self, deadline: u64) {
        // Sleeping against a manual clock jumps it forward.
        let now = self.now.load(Ordering::SeqCst);
        if deadline > now {
            self.now.store(deadline, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), 0);
        clock.advance(1_000);
        assert_eq!(clock.now(), 1_000);
        clock.sleep_until(5_000);
        assert_eq!(clock.now(), 5_000);
        // Sleeping into the past is a no-op.
        clock.sleep_until(100);
        assert_eq!(clock.now(), 5_000);
    }

    #[test]
    fn monotonic_clock_moves() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
