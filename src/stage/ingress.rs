use std::sync::Arc;

use tracing::warn;

use crate::clock::Clock;
use crate::impairment::{DrawSource, Impairment, SeededDraws};
use crate::packet::Packet;
use crate::port::Port;
use crate::ring::Producer;
use crate::stage::Stage;
use crate::stats::PathStats;

/// Capture, impair, timestamp, hand to the delay queue.
pub struct IngressStage<C, D = SeededDraws> {
    port: Arc<dyn Port>,
    clock: C,
    impairment: Impairment<D>,
    delay_tx: Producer<Packet>,
    stats: Arc<PathStats>,
    burst: usize,
    rx_buf: Vec<Packet>,
    batch: Vec<Packet>,
}

impl<C: Clock, D: DrawSource> IngressStage<C, D> {
    pub fn new(
        port: Arc<dyn Port>,
        clock: C,
        impairment: Impairment<D>,
        delay_tx: Producer<Packet>,
        stats: Arc<PathStats>,
        burst: usize,
    ) -> Self {
        Self {
            port,
            clock,
            impairment,
            delay_tx,
            stats,
            burst,
            rx_buf: Vec::with_capacity(burst),
            // Worst case every packet is duplicated.
            batch: Vec::with_capacity(burst * 2),
        }
    }

    pub fn port_name(&self) -> &str {
        self.port.name()
    }
}

impl<C: Clock, D: DrawSource> Stage for IngressStage<C, D> {
    fn kind(&self) -> &'static str {
        "ingress"
    }

    fn poll(&mut self) -> usize {
        let received = self.port.receive_burst(&mut self.rx_buf, self.burst);
        if received == 0 {
            return 0;
        }
        let counters = &self.stats.ingress;
        counters.rx.add(received as u64);

        let mut lost = 0u64;
        let mut duplicated = 0u64;
        let mut clone_failed = 0u64;
        for mut pkt in self.rx_buf.drain(..) {
            if self.impairment.is_lost() {
                lost += 1;
                continue;
            }
            pkt.stamp(self.clock.now());
            let duplicate = if self.impairment.is_duplicated() {
                match pkt.try_clone() {
                    Ok(clone) => Some(clone),
                    Err(e) => {
                        warn!(port = self.port.name(), error = %e, "cannot clone a packet");
                        clone_failed += 1;
                        None
                    }
                }
            } else {
                None
            };
            self.batch.push(pkt);
            if let Some(clone) = duplicate {
                duplicated += 1;
                self.batch.push(clone);
            }
        }

        let overflow = self.delay_tx.push_burst_or_free(&mut self.batch);
        counters.loss_dropped.add(lost);
        counters.duplicated.add(duplicated);
        counters.clone_failed.add(clone_failed);
        counters.delay_overflow.add(overflow as u64);
        received
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::impairment::testing::ScriptedDraws;
    use crate::impairment::{Duplicator, LossMode, percent_to_threshold};
    use crate::packet::PacketPool;
    use crate::port::MemoryPort;
    use crate::ring::{Consumer, bounded};
    use crate::stage::testing::{frames, seq};

    struct Rig {
        pool: Arc<PacketPool>,
        port: Arc<MemoryPort>,
        clock: ManualClock,
        stats: Arc<PathStats>,
        delay_rx: Consumer<Packet>,
        stage: IngressStage<ManualClock, ScriptedDraws>,
    }

    fn rig(loss: LossMode, dup: u64, draws: &[u64], pool: usize, queue: usize) -> Rig {
        let pool = PacketPool::new(pool);
        let port = Arc::new(MemoryPort::new("p0", pool.clone()));
        let clock = ManualClock::nanos();
        let stats = PathStats::new("p0 -> p1");
        let (delay_tx, delay_rx) = bounded(queue);
        let impairment = Impairment::new(
            loss.instantiate(loss.new_chain()),
            Duplicator::new(dup),
            ScriptedDraws::new(draws),
        );
        let stage = IngressStage::new(
            port.clone(),
            clock.clone(),
            impairment,
            delay_tx,
            stats.clone(),
            64,
        );
        Rig {
            pool,
            port,
            clock,
            stats,
            delay_rx,
            stage,
        }
    }

    #[test]
    fn test_empty_port_is_idle() {
        let mut r = rig(LossMode::None, 0, &[], 16, 16);
        assert_eq!(r.stage.poll(), 0);
        assert_eq!(r.stats.snapshot().rx, 0);
    }

    #[test]
    fn test_loss_and_timestamps() {
        // Loss threshold 10: draws below it drop the packet.
        let mut r = rig(LossMode::Uniform { loss: 10 }, 0, &[50, 5, 50, 0], 16, 16);
        r.port.inject(frames(4, 60));
        r.clock.set(777);
        assert_eq!(r.stage.poll(), 4);

        let mut out = Vec::new();
        r.delay_rx.pop_burst(&mut out, 16);
        let seqs: Vec<_> = out.iter().map(|p| seq(p.payload())).collect();
        assert_eq!(seqs, vec![0, 2]);
        assert!(out.iter().all(|p| p.arrival() == 777));

        let s = r.stats.snapshot();
        assert_eq!(s.rx, 4);
        assert_eq!(s.loss_dropped, 2);
    }

    #[test]
    fn test_duplicate_is_adjacent_with_same_timestamp() {
        // No loss; per packet one duplication draw, duplicate below 10.
        let mut r = rig(LossMode::None, 10, &[50, 3, 50], 16, 16);
        r.port.inject(frames(3, 60));
        r.clock.set(42);
        r.stage.poll();

        let mut out = Vec::new();
        r.delay_rx.pop_burst(&mut out, 16);
        let seqs: Vec<_> = out.iter().map(|p| seq(p.payload())).collect();
        assert_eq!(seqs, vec![0, 1, 1, 2]);
        assert!(out.iter().all(|p| p.arrival() == 42));
        assert_eq!(r.stats.snapshot().duplicated, 1);
    }

    #[test]
    fn test_clone_failure_still_forwards_original() {
        // Pool of 2: both captures fit, no room for the clone.
        let always = percent_to_threshold(100.0);
        let mut r = rig(LossMode::None, always, &[0, 0], 2, 16);
        r.port.inject(frames(2, 60));
        r.stage.poll();

        let mut out = Vec::new();
        r.delay_rx.pop_burst(&mut out, 16);
        assert_eq!(out.len(), 2);
        let s = r.stats.snapshot();
        assert_eq!(s.clone_failed, 2);
        assert_eq!(s.duplicated, 0);
    }

    #[test]
    fn test_delay_queue_overflow_frees_tail() {
        let mut r = rig(LossMode::None, 0, &[], 64, 5);
        r.port.inject(frames(8, 60));
        r.stage.poll();

        let mut out = Vec::new();
        r.delay_rx.pop_burst(&mut out, 16);
        let seqs: Vec<_> = out.iter().map(|p| seq(p.payload())).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);

        let s = r.stats.snapshot();
        assert_eq!(s.delay_overflow, 3);
        assert!(s.is_conserved(5));
        // Rejected packets went back to the pool.
        assert_eq!(r.pool.in_use(), 5);
        drop(out);
        assert_eq!(r.pool.in_use(), 0);
    }
}
