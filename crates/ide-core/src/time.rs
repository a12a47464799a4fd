//! Tick-based time used by channel timers and the bounded reset polls.
//!
//! All deadlines in this crate are absolute [`Tick`] values read from a [`Clock`]. Production
//! code uses [`StdClock`]; tests drive the core deterministically through [`FakeClock`], whose
//! `delay` advances time instead of sleeping so every bounded poll terminates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub type Tick = u64;

/// Ticks per second.
pub const HZ: Tick = 1000;

/// Worst-case time a device may take to come back from a reset.
pub const WAIT_WORSTCASE: Tick = 30 * HZ;
/// Default completion timeout for an armed command handler.
pub const WAIT_CMD: Tick = 10 * HZ;
/// Shortest idle-wake timer the scheduler arms for a sleeping device.
pub const WAIT_MIN_SLEEP: Tick = 2 * HZ / 100;
/// Interval between status reads while polling for a reset to finish.
pub const RESET_POLL_INTERVAL: Tick = HZ / 20;

pub trait Clock: Send + Sync {
    fn now(&self) -> Tick;

    /// Busy-wait (or sleep) for `ticks`.
    fn delay(&self, ticks: Tick);
}

/// Deterministic clock for tests.
#[derive(Debug, Default)]
pub struct FakeClock {
    now: AtomicU64,
}

impl FakeClock {
    pub fn new(start: Tick) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn advance(&self, ticks: Tick) {
        self.now.fetch_add(ticks, Ordering::SeqCst);
    }

    pub fn set(&self, now: Tick) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Tick {
        self.now.load(Ordering::SeqCst)
    }

    fn delay(&self, ticks: Tick) {
        self.advance(ticks);
    }
}

/// Monotonic host clock.
#[derive(Debug)]
pub struct StdClock {
    origin: Instant,
}

impl StdClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for StdClock {
    fn now(&self) -> Tick {
        let nanos = self.origin.elapsed().as_nanos();
        (nanos * HZ as u128 / 1_000_000_000u128) as Tick
    }

    fn delay(&self, ticks: Tick) {
        let nanos = (ticks as u128) * 1_000_000_000u128 / HZ as u128;
        std::thread::sleep(Duration::from_nanos(nanos.min(u64::MAX as u128) as u64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_delay_advances_time() {
        let clock = FakeClock::new(5);
        clock.delay(RESET_POLL_INTERVAL);
        assert_eq!(clock.now(), 5 + RESET_POLL_INTERVAL);
        clock.set(1);
        assert_eq!(clock.now(), 1);
    }

    #[test]
    fn std_clock_is_monotonic() {
        let clock = StdClock::new();
        let a = clock.now();
        clock.delay(1);
        assert!(clock.now() >= a + 1);
    }
}
