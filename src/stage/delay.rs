use std::collections::VecDeque;
use std::sync::Arc;

use crate::clock::Clock;
use crate::packet::Packet;
use crate::ring::{Consumer, Producer};
use crate::stage::Stage;
use crate::stats::PathStats;

/// Holds packets until they are `threshold` cycles old, then forwards them
/// to the paired port's egress queue.
///
/// Arrival stamps are monotonic within one delay queue and the threshold is
/// the same for every packet of the link, so only the head ever needs to be
/// checked: once the head is too young, everything behind it is too.
pub struct DelayStage<C> {
    clock: C,
    threshold: u64,
    delay_rx: Consumer<Packet>,
    egress_tx: Producer<Packet>,
    stats: Arc<PathStats>,
    burst: usize,
    pending: VecDeque<Packet>,
    ready: Vec<Packet>,
}

impl<C: Clock> DelayStage<C> {
    pub fn new(
        clock: C,
        threshold: u64,
        delay_rx: Consumer<Packet>,
        egress_tx: Producer<Packet>,
        stats: Arc<PathStats>,
        burst: usize,
    ) -> Self {
        Self {
            clock,
            threshold,
            delay_rx,
            egress_tx,
            stats,
            burst,
            pending: VecDeque::with_capacity(burst),
            ready: Vec::with_capacity(burst),
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Packets dequeued but not yet old enough.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl<C: Clock> Stage for DelayStage<C> {
    fn kind(&self) -> &'static str {
        "delay"
    }

    fn poll(&mut self) -> usize {
        let room = self.burst.saturating_sub(self.pending.len());
        if room > 0 {
            self.delay_rx.pop_burst(&mut self.pending, room);
        }
        if self.pending.is_empty() {
            return 0;
        }

        let now = self.clock.now();
        while let Some(head) = self.pending.front() {
            if now.saturating_sub(head.arrival()) < self.threshold {
                break;
            }
            if let Some(pkt) = self.pending.pop_front() {
                self.ready.push(pkt);
            }
        }
        let released = self.ready.len();
        if released == 0 {
            return 0;
        }

        let overflow = self.egress_tx.push_burst_or_free(&mut self.ready);
        self.stats.delay.released.add(released as u64);
        self.stats.delay.egress_overflow.add(overflow as u64);
        released
    }
}
