//! Per-stream token bucket
//!
//! Resolution is packets. Fractional accrual is preserved across calls so
//! low rates do not alias against the egress tick interval.

use netblast_timer::Timestamp;

const NANOS_PER_SEC: f64 = 1e9;

/// Pacing state: refill on consultation, admit whole packets only.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate_pps: f64,
    last_ns: u64,
}

impl TokenBucket {
    /// A bucket starts full. The capacity is the configured burst, with a
    /// floor of one packet so that a burst of zero still admits single
    /// packets once a whole token has accrued.
    pub fn new(rate_pps: f64, burst: u32, now: Timestamp) -> Self {
        let capacity = f64::from(burst).max(1.0);
        TokenBucket {
            tokens: capacity,
            capacity,
            rate_pps: rate_pps.max(0.0),
            last_ns: now.as_nanos(),
        }
    }

    /// Accrue tokens up to the capacity. A clock reading earlier than the
    /// last refill is clamped; the bucket never drains backwards.
    pub fn refill(&mut self, now: Timestamp) {
        let now_ns = now.as_nanos().max(self.last_ns);
        let elapsed = (now_ns - self.last_ns) as f64;
        self.tokens = (self.tokens + elapsed * self.rate_pps / NANOS_PER_SEC).min(self.capacity);
        self.last_ns = now_ns;
    }

    /// Refill, then admit `n` packets if the balance covers them.
    pub fn consume(&mut self, n: f64, now: Timestamp) -> bool {
        self.refill(now);
        if self.rate_pps <= 0.0 {
            return false;
        }
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn rate_pps(&self) -> f64 {
        self.rate_pps
    }
}
