//! Monotonic timestamps
//!
//! Thin wrapper over `CLOCK_MONOTONIC`. Seconds and nanoseconds are kept
//! separate because both the capture writer and the stream materializer
//! serialize them as distinct fields.

use std::ops::{Add, Sub};
use std::time::Duration;

pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// A monotonic point in time (seconds + nanoseconds since boot).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    sec: i64,
    nsec: u32,
}

impl Timestamp {
    /// Read the current monotonic clock.
    pub fn now() -> Self {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        Timestamp {
            sec: ts.tv_sec as i64,
            nsec: ts.tv_nsec as u32,
        }
    }

    pub fn from_nanos(ns: u64) -> Self {
        Timestamp {
            sec: (ns / NANOS_PER_SEC) as i64,
            nsec: (ns % NANOS_PER_SEC) as u32,
        }
    }

    /// Total nanoseconds since the clock origin.
    pub fn as_nanos(&self) -> u64 {
        self.sec.max(0) as u64 * NANOS_PER_SEC + self.nsec as u64
    }

    pub fn sec(&self) -> i64 {
        self.sec
    }

    pub fn nsec(&self) -> u32 {
        self.nsec
    }

    pub fn saturating_sub(&self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.as_nanos().saturating_sub(earlier.as_nanos()))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp::from_nanos(self.as_nanos() + rhs.as_nanos() as u64)
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Duration {
        self.saturating_sub(rhs)
    }
}
