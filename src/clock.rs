use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use tracing::debug;

const US_PER_S: u64 = 1_000_000;

/// Monotonic cycle counter shared by every stage.
///
/// Timestamps are raw cycles so that the hot path never converts units;
/// durations are converted once, at configuration time, with `us_to_cycles`.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
    fn hz(&self) -> u64;

    fn cycles_per_us(&self) -> u64 {
        (self.hz() + US_PER_S - 1) / US_PER_S
    }

    fn us_to_cycles(&self, us: u64) -> u64 {
        self.cycles_per_us().saturating_mul(us)
    }
}

// ==========================================
// TSC clock
// ==========================================

lazy_static! {
    // Measured once per process; every TscClock shares it.
    static ref TSC_HZ: u64 = calibrate();
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn read_counter() -> u64 {
    // SAFETY: rdtsc has no preconditions on x86_64.
    #[allow(unused_unsafe)]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
fn read_counter() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: valid pointer to a stack timespec.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(target_arch = "x86_64")]
fn calibrate() -> u64 {
    let start = Instant::now();
    let c0 = read_counter();
    std::thread::sleep(Duration::from_millis(20));
    let c1 = read_counter();
    let elapsed = start.elapsed().as_nanos().max(1) as u64;
    let hz = ((c1.wrapping_sub(c0)) as u128 * 1_000_000_000 / elapsed as u128) as u64;
    debug!(hz, "calibrated cycle counter");
    hz.max(US_PER_S)
}

#[cfg(not(target_arch = "x86_64"))]
fn calibrate() -> u64 {
    debug!("no cycle counter, using CLOCK_MONOTONIC nanoseconds");
    1_000_000_000
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TscClock;

impl TscClock {
    pub fn new() -> Self {
        // Force calibration before any stage starts timing.
        let _ = *TSC_HZ;
        Self
    }
}

impl Clock for TscClock {
    #[inline(always)]
    fn now(&self) -> u64 {
        read_counter()
    }

    fn hz(&self) -> u64 {
        *TSC_HZ
    }
}

// ==========================================
// Manual clock (tests, simulations)
// ==========================================

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
    hz: u64,
}

impl ManualClock {
    pub fn new(hz: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(0)),
            hz,
        }
    }

    /// One cycle per nanosecond.
    pub fn nanos() -> Self {
        Self::new(1_000_000_000)
    }

    pub fn set(&self, cycles: u64) {
        self.now.store(cycles, Ordering::Release);
    }

    pub fn advance(&self, cycles: u64) {
        self.now.fetch_add(cycles, Ordering::AcqRel);
    }

    pub fn advance_us(&self, us: u64) {
        self.advance(self.us_to_cycles(us));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    fn hz(&self) -> u64 {
        self.hz
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> u64 {
        (**self).now()
    }

    fn hz(&self) -> u64 {
        (**self).hz()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_us_to_cycles_rounds_up_per_us() {
        let clock = ManualClock::new(2_500_000_001);
        assert_eq!(clock.cycles_per_us(), 2501);
        assert_eq!(clock.us_to_cycles(1000), 2_501_000);
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::nanos();
        let other = clock.clone();
        clock.advance_us(3);
        assert_eq!(other.now(), 3000);
        other.set(10);
        assert_eq!(clock.now(), 10);
    }

    #[test]
    fn test_tsc_clock_is_monotonic() {
        let clock = TscClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!(clock.hz() >= US_PER_S);
    }
}
