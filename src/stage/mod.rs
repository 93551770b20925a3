use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

mod delay;
mod egress;
mod ingress;

pub use delay::DelayStage;
pub use egress::EgressStage;
pub use ingress::IngressStage;

/// Upper bound on packets moved per stage iteration.
pub const MAX_BURST: usize = 32768;

/// Process-wide stop flag. Every stage checks it at the top of each
/// iteration and exits on its own; nothing is drained.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What a stage does when an iteration finds no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollPolicy {
    /// Busy-spin. The core is dedicated.
    #[default]
    Spin,
    /// Give the core back to the scheduler.
    Yield,
    /// Sleep for a fixed period. Adds up to that period of latency.
    Sleep(Duration),
}

impl PollPolicy {
    #[inline(always)]
    pub fn idle(&self) {
        match self {
            PollPolicy::Spin => std::hint::spin_loop(),
            PollPolicy::Yield => std::thread::yield_now(),
            PollPolicy::Sleep(period) => std::thread::sleep(*period),
        }
    }
}

// One pipeline stage, pinned to one core.
pub trait Stage: Send {
    fn kind(&self) -> &'static str;

    /// Run one iteration. Returns the number of packets (or ticks) handled;
    /// zero means there was nothing to do.
    fn poll(&mut self) -> usize;

    fn run(&mut self, shutdown: &Shutdown, policy: PollPolicy) {
        while !shutdown.is_triggered() {
            if self.poll() == 0 {
                policy.idle();
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    struct Countdown(usize, Shutdown);

    impl Stage for Countdown {
        fn kind(&self) -> &'static str {
            "countdown"
        }

        fn poll(&mut self) -> usize {
            if self.0 == 0 {
                self.1.trigger();
                return 0;
            }
            self.0 -= 1;
            1
        }
    }

    #[test]
    fn test_run_exits_on_shutdown() {
        let shutdown = Shutdown::new();
        let mut stage = Countdown(1000, shutdown.clone());
        stage.run(&shutdown, PollPolicy::Yield);
        assert_eq!(stage.0, 0);
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn test_already_triggered_never_polls() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let mut stage = Countdown(5, shutdown.clone());
        stage.run(&shutdown, PollPolicy::Spin);
        assert_eq!(stage.0, 5);
    }
}
