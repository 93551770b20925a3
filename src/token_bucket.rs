// ================= Shared token bucket =================
//
// Balance is in bits. The rate limiter is the only writer that adds tokens;
// egress stages are the only writers that take them. Both sides use CAS so
// the balance can neither go negative nor exceed the cap.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::ring::CachePadded;

/// Burst allowance: the balance is capped at this multiple of one second's
/// worth of tokens.
pub const CAP_FACTOR: f64 = 1.2;

// Spending side of a bucket, as seen by an egress stage.
pub trait TokenBucketLimiter: Send + Sync {
    fn is_unlimited(&self) -> bool;
    fn try_consume(&self, bits: u64) -> bool;
    fn refund(&self, bits: u64);
}

pub struct TokenBucket {
    tokens: CachePadded<AtomicU64>,
    rate_bps: u64,
    cap: u64,
}

impl TokenBucket {
    /// `rate_bps == 0` means unlimited; the bucket is then never consulted.
    pub fn new(rate_bps: u64) -> Self {
        Self {
            tokens: CachePadded::new(AtomicU64::new(0)),
            rate_bps,
            cap: (rate_bps as f64 * CAP_FACTOR) as u64,
        }
    }

    pub fn rate_bps(&self) -> u64 {
        self.rate_bps
    }

    pub fn cap(&self) -> u64 {
        self.cap
    }

    pub fn balance(&self) -> u64 {
        self.tokens.value.load(Ordering::Acquire)
    }

    /// Add up to `bits`, clamped to the cap. Returns what was actually added.
    pub fn deposit(&self, bits: u64) -> u64 {
        if bits == 0 {
            return 0;
        }
        let mut current = self.tokens.value.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(bits).min(self.cap);
            if next == current {
                return 0;
            }
            match self.tokens.value.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next - current,
                Err(actual) => current = actual,
            }
        }
    }
}

impl TokenBucketLimiter for TokenBucket {
    fn is_unlimited(&self) -> bool {
        self.rate_bps == 0
    }

    fn try_consume(&self, bits: u64) -> bool {
        let mut current = self.tokens.value.load(Ordering::Relaxed);
        loop {
            if current < bits {
                return false;
            }
            match self.tokens.value.compare_exchange_weak(
                current,
                current - bits,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn refund(&self, bits: u64) {
        self.deposit(bits);
    }
}
