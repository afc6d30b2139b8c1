//! # Time
//!
//! Absolute timestamps for wake deadlines. Time is counted in microseconds
//! since boot, so a `u64` never wraps in practice.

use core::time::Duration;

/// An absolute point in time, in microseconds since boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(u64);

impl Instant {
    /// Boot.
    pub const ZERO: Instant = Instant(0);

    /// Sentinel deadline meaning "no deadline": sleep until explicitly woken.
    pub const END_OF_TIME: Instant = Instant(u64::MAX);

    pub const fn from_micros(us: u64) -> Self {
        Instant(us)
    }

    pub const fn from_millis(ms: u64) -> Self {
        Instant(ms.saturating_mul(1000))
    }

    pub const fn as_micros(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_end_of_time(self) -> bool {
        self.0 == u64::MAX
    }

    /// `self + d`, saturating at [`Instant::END_OF_TIME`].
    pub fn saturating_add(self, d: Duration) -> Self {
        let us = u64::try_from(d.as_micros()).unwrap_or(u64::MAX);
        Instant(self.0.saturating_add(us))
    }

    /// Microseconds from `earlier` to `self`, or zero if `earlier` is later.
    pub const fn micros_since(self, earlier: Instant) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl core::ops::Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, d: Duration) -> Instant {
        self.saturating_add(d)
    }
}
