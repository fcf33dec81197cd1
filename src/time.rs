//! Time keeping and the periodic timer contract.
//!
//! The core does not know what the timer hardware is. A driver registers
//! a monotonic nanosecond source and arranges for a periodic per-executor
//! interrupt whose handler calls [`timer_interrupt`].

use core::sync::atomic::{AtomicU64, Ordering};

pub use core::time::Duration;

use spin::Once;

/// A moment on the monotonic clock, in nanoseconds since boot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant {
    ns: u64,
}

impl Instant {
    pub const ZERO: Instant = Instant { ns: 0 };

    pub const fn from_nanos(ns: u64) -> Self {
        Self { ns }
    }

    pub const fn as_nanos(self) -> u64 {
        self.ns
    }

    pub fn checked_add(self, duration: Duration) -> Option<Instant> {
        let ns = u64::try_from(duration.as_nanos()).ok()?;
        self.ns.checked_add(ns).map(|ns| Instant { ns })
    }

    pub fn saturating_duration_since(self, earlier: Instant) -> Duration {
        Duration::from_nanos(self.ns.saturating_sub(earlier.ns))
    }
}

impl core::ops::Add<Duration> for Instant {
    type Output = Instant;
    fn add(self, duration: Duration) -> Instant {
        self.checked_add(duration).expect("instant overflow")
    }
}

/// Monotonic nanosecond counter provider, registered once by the timer
/// driver.
static CLOCK_SOURCE: Once<fn() -> u64> = Once::new();

/// Fallback tick counter advanced by `timer_interrupt` when no clock
/// source is registered (early boot, tests).
static FALLBACK_TICK_NS: AtomicU64 = AtomicU64::new(0);

pub fn set_clock_source(source: fn() -> u64) {
    CLOCK_SOURCE.call_once(|| source);
}

pub fn now() -> Instant {
    match CLOCK_SOURCE.get() {
        Some(source) => Instant::from_nanos(source()),
        None => Instant::from_nanos(FALLBACK_TICK_NS.load(Ordering::Acquire)),
    }
}

/// Entry point for the per-executor periodic timer interrupt.
///
/// Runs in interrupt context: wakes due sleepers, then offers the
/// scheduler a preemption point.
pub fn timer_interrupt() {
    if CLOCK_SOURCE.get().is_none() {
        FALLBACK_TICK_NS.fetch_add(
            crate::multitasking::scheduler::TIME_SLICE.as_nanos() as u64,
            Ordering::Release,
        );
    }

    let now = now();
    crate::multitasking::scheduler::wake_due_sleepers(now);
    crate::multitasking::scheduler::maybe_preempt();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_arithmetic() {
        let start = Instant::from_nanos(1_000);
        let later = start + Duration::from_nanos(500);
        assert_eq!(later.as_nanos(), 1_500);

        assert_eq!(
            later.saturating_duration_since(start),
            Duration::from_nanos(500)
        );
        assert_eq!(
            start.saturating_duration_since(later),
            Duration::from_nanos(0)
        );

        assert!(Instant::from_nanos(u64::MAX)
            .checked_add(Duration::from_nanos(1))
            .is_none());
    }
}
