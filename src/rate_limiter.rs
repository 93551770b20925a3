// ==========================================
// Token bucket refill loop
// ==========================================
//
// One tick per microsecond deposits rate / 1e6 bits. The sub-bit remainder
// is carried in millionths of a bit so that, over any whole number of
// seconds, exactly `rate` bits are offered to the bucket.

use std::sync::Arc;

use crate::clock::Clock;
use crate::stage::Stage;
use crate::token_bucket::TokenBucket;

const TICKS_PER_SEC: u64 = 1_000_000;

pub struct RateLimiter<C> {
    bucket: Arc<TokenBucket>,
    clock: C,
    tick_cycles: u64,
    next_tick: u64,
    carry: u64,
}

impl<C: Clock> RateLimiter<C> {
    pub fn new(bucket: Arc<TokenBucket>, clock: C) -> Self {
        let tick_cycles = clock.cycles_per_us().max(1);
        let next_tick = clock.now().saturating_add(tick_cycles);
        Self {
            bucket,
            clock,
            tick_cycles,
            next_tick,
            carry: 0,
        }
    }

    pub fn bucket(&self) -> &Arc<TokenBucket> {
        &self.bucket
    }

    /// Deposit `ticks` microseconds' worth of tokens. Returns the bits
    /// offered to the bucket (before capping).
    pub fn credit(&mut self, ticks: u64) -> u64 {
        let rate = self.bucket.rate_bps() as u128;
        let ticks = ticks as u128;
        let per_sec = TICKS_PER_SEC as u128;

        let remainder = self.carry as u128 + ticks * (rate % per_sec);
        let bits = ticks * (rate / per_sec) + remainder / per_sec;
        self.carry = (remainder % per_sec) as u64;

        let bits = bits.min(u64::MAX as u128) as u64;
        self.bucket.deposit(bits);
        bits
    }
}

impl<C: Clock> Stage for RateLimiter<C> {
    fn kind(&self) -> &'static str {
        "rate-limiter"
    }

    /// Credit every tick that has elapsed since the last poll. Ticks sit on
    /// an absolute grid, so a late poll catches up instead of losing time.
    fn poll(&mut self) -> usize {
        let now = self.clock.now();
        if now < self.next_tick {
            return 0;
        }
        let ticks = (now - self.next_tick) / self.tick_cycles + 1;
        self.next_tick = self
            .next_tick
            .saturating_add(ticks.saturating_mul(self.tick_cycles));
        self.credit(ticks);
        ticks as usize
    }
}
