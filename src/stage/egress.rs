use std::collections::VecDeque;
use std::sync::Arc;

use crate::packet::Packet;
use crate::port::{Port, SendOutcome};
use crate::ring::Consumer;
use crate::stage::{Shutdown, Stage};
use crate::stats::PathStats;
use crate::token_bucket::TokenBucketLimiter;

/// Fraction of one burst the holding area may reach before it is dropped.
const GIVE_UP_FRACTION: f64 = 0.8;

/// Drains the egress queue of one port and transmits, shaped by the shared
/// token bucket.
pub struct EgressStage<L: ?Sized> {
    port: Arc<dyn Port>,
    egress_rx: Consumer<Packet>,
    bucket: Arc<L>,
    stats: Arc<PathStats>,
    shutdown: Shutdown,
    burst: usize,
    give_up: usize,
    held: VecDeque<Packet>,
}

impl<L: TokenBucketLimiter + ?Sized> EgressStage<L> {
    /// `stats` is the path that ends at this port.
    pub fn new(
        port: Arc<dyn Port>,
        egress_rx: Consumer<Packet>,
        bucket: Arc<L>,
        stats: Arc<PathStats>,
        shutdown: Shutdown,
        burst: usize,
    ) -> Self {
        let give_up = ((burst as f64 * GIVE_UP_FRACTION) as usize).max(1);
        Self {
            port,
            egress_rx,
            bucket,
            stats,
            shutdown,
            burst,
            give_up,
            held: VecDeque::with_capacity(burst),
        }
    }

    /// Packets carried over to the next iteration.
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Drop the packets `outcome` consumed from the head of the holding area.
    /// Returns how many that was.
    fn retire(&mut self, outcome: SendOutcome) -> usize {
        let bits: u64 = self.held.drain(..outcome.sent).map(|p| p.len_bits()).sum();
        self.stats.egress.tx.add(outcome.sent as u64);
        self.stats.egress.tx_bits.add(bits);
        if outcome.rejected && self.held.pop_front().is_some() {
            self.stats.egress.tx_error.add(1);
        }
        outcome.consumed()
    }

    /// Send everything held, reissuing on short sends.
    fn send_unlimited(&mut self) -> usize {
        let mut done = 0;
        while !self.held.is_empty() {
            let outcome = self.port.send_burst(self.held.make_contiguous());
            done += self.retire(outcome);
            if !self.held.is_empty() && self.shutdown.is_triggered() {
                break;
            }
        }
        done
    }

    fn send_shaped(&mut self) -> usize {
        let mut paid = 0;
        for pkt in self.held.iter() {
            if !self.bucket.try_consume(pkt.len_bits()) {
                break;
            }
            paid += 1;
        }

        let mut done = 0;
        if paid > 0 {
            let outcome = self.port.send_burst(&self.held.make_contiguous()[..paid]);
            if outcome.sent < paid {
                // A refused frame never used the wire either.
                let unsent: u64 = self.held.range(outcome.sent..paid).map(|p| p.len_bits()).sum();
                self.bucket.refund(unsent);
            }
            done = self.retire(outcome);
        }

        if self.held.len() >= self.give_up {
            let starved = self.held.len();
            self.held.clear();
            self.stats.egress.token_starved.add(starved as u64);
        }
        done
    }
}

impl<L: TokenBucketLimiter + ?Sized> Stage for EgressStage<L> {
    fn kind(&self) -> &'static str {
        "egress"
    }

    fn poll(&mut self) -> usize {
        let room = self.burst.saturating_sub(self.held.len());
        if room > 0 {
            self.egress_rx.pop_burst(&mut self.held, room);
        }
        if self.held.is_empty() {
            return 0;
        }
        if self.bucket.is_unlimited() {
            self.send_unlimited()
        } else {
            self.send_shaped()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketPool;
    use crate::port::MemoryPort;
    use crate::ring::{Producer, bounded};
    use crate::stage::testing::{seq, stamped};
    use crate::token_bucket::TokenBucket;

    // 100-byte frames: 800 bits each.
    const FRAME: usize = 100;

    struct Rig {
        pool: Arc<PacketPool>,
        port: Arc<MemoryPort>,
        bucket: Arc<TokenBucket>,
        stats: Arc<PathStats>,
        egress_tx: Producer<Packet>,
        stage: EgressStage<TokenBucket>,
    }

    fn rig(rate_bps: u64, burst: usize) -> Rig {
        let pool = PacketPool::new(1024);
        let port = Arc::new(MemoryPort::new("b", pool.clone()));
        let bucket = Arc::new(TokenBucket::new(rate_bps));
        let stats = PathStats::new("a -> b");
        let (egress_tx, egress_rx) = bounded(512);
        let stage = EgressStage::new(
            port.clone(),
            egress_rx,
            bucket.clone(),
            stats.clone(),
            Shutdown::new(),
            burst,
        );
        Rig {
            pool,
            port,
            bucket,
            stats,
            egress_tx,
            stage,
        }
    }

    fn feed(r: &mut Rig, n: usize) {
        let mut batch = stamped(&r.pool, n, FRAME, 0);
        r.egress_tx.push_burst(&mut batch);
    }

    fn sent_seqs(port: &MemoryPort) -> Vec<usize> {
        port.take_transmitted().iter().map(|t| seq(&t.data)).collect()
    }

    #[test]
    fn test_unlimited_sends_everything() {
        let mut r = rig(0, 64);
        feed(&mut r, 20);
        assert_eq!(r.stage.poll(), 20);
        assert_eq!(sent_seqs(&r.port), (0..20).collect::<Vec<_>>());
        let s = r.stats.snapshot();
        assert_eq!(s.tx, 20);
        assert_eq!(s.tx_bits, 20 * 800);
        assert_eq!(r.pool.in_use(), 0);
    }

    #[test]
    fn test_unlimited_retries_short_sends() {
        let mut r = rig(0, 64);
        r.port.set_accept_limit(Some(3));
        feed(&mut r, 10);
        assert_eq!(r.stage.poll(), 10);
        assert_eq!(sent_seqs(&r.port), (0..10).collect::<Vec<_>>());
        assert_eq!(r.stage.held(), 0);
    }

    #[test]
    fn test_shaped_sends_paid_prefix_and_holds_rest() {
        let mut r = rig(1_000_000, 64);
        r.bucket.deposit(3 * 800 + 100);
        feed(&mut r, 5);

        assert_eq!(r.stage.poll(), 3);
        assert_eq!(sent_seqs(&r.port), vec![0, 1, 2]);
        assert_eq!(r.stage.held(), 2);
        assert_eq!(r.bucket.balance(), 100);

        r.bucket.deposit(800);
        assert_eq!(r.stage.poll(), 1);
        assert_eq!(sent_seqs(&r.port), vec![3]);
        assert_eq!(r.stage.held(), 1);
    }

    #[test]
    fn test_short_send_refunds_tokens() {
        let mut r = rig(1_000_000, 64);
        r.bucket.deposit(10 * 800);
        r.port.set_accept_limit(Some(4));
        feed(&mut r, 6);

        assert_eq!(r.stage.poll(), 4);
        assert_eq!(r.bucket.balance(), 10 * 800 - 4 * 800);
        assert_eq!(r.stage.held(), 2);

        r.port.set_accept_limit(None);
        assert_eq!(r.stage.poll(), 2);
        assert_eq!(sent_seqs(&r.port), (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn test_holding_area_gives_up_at_eighty_percent() {
        // burst 10 -> give up at 8 held.
        let mut r = rig(1_000_000, 10);
        feed(&mut r, 7);
        assert_eq!(r.stage.poll(), 0);
        assert_eq!(r.stage.held(), 7);
        assert_eq!(r.stats.snapshot().token_starved, 0);

        feed(&mut r, 1);
        assert_eq!(r.stage.poll(), 0);
        assert_eq!(r.stage.held(), 0);
        let s = r.stats.snapshot();
        assert_eq!(s.token_starved, 8);
        assert_eq!(s.tx, 0);
        assert_eq!(r.pool.in_use(), 0);
    }

    #[test]
    fn test_balance_drains_to_zero_not_below() {
        let mut r = rig(1_000_000, 64);
        r.bucket.deposit(800 * 4);
        feed(&mut r, 4);
        r.stage.poll();
        assert_eq!(r.bucket.balance(), 0);
        feed(&mut r, 1);
        assert_eq!(r.stage.poll(), 0);
        assert_eq!(r.bucket.balance(), 0);
    }

    #[test]
    fn test_unlimited_refused_frame_is_counted_not_sent() {
        let mut r = rig(0, 64);
        feed(&mut r, 2);
        let mut big = stamped(&r.pool, 1, 4000, 0);
        r.egress_tx.push_burst(&mut big);
        feed(&mut r, 2);
        r.port.set_mtu(Some(1500));

        assert_eq!(r.stage.poll(), 5);
        assert_eq!(sent_seqs(&r.port), vec![0, 1, 0, 1]);
        let s = r.stats.snapshot();
        assert_eq!(s.tx, 4);
        assert_eq!(s.tx_bits, 4 * 800);
        assert_eq!(s.tx_error, 1);
        assert_eq!(s.dropped(), 1);
        assert_eq!(r.stage.held(), 0);
        assert_eq!(r.pool.in_use(), 0);
    }

    #[test]
    fn test_shaped_refused_frame_refunds_its_tokens() {
        let mut r = rig(1_000_000, 64);
        r.bucket.deposit(800 + 32_000 + 800);
        feed(&mut r, 1);
        let mut big = stamped(&r.pool, 1, 4000, 0);
        r.egress_tx.push_burst(&mut big);
        feed(&mut r, 1);
        r.port.set_mtu(Some(1500));

        // First frame sent, second refused, third paid for but not reached.
        assert_eq!(r.stage.poll(), 2);
        assert_eq!(sent_seqs(&r.port), vec![0]);
        assert_eq!(r.bucket.balance(), 32_000 + 800);
        assert_eq!(r.stage.held(), 1);
        assert_eq!(r.stats.snapshot().tx_error, 1);

        assert_eq!(r.stage.poll(), 1);
        assert_eq!(sent_seqs(&r.port), vec![0]);
        assert_eq!(r.bucket.balance(), 32_000);
        let s = r.stats.snapshot();
        assert_eq!(s.tx, 2);
        assert_eq!(s.tx_bits, 2 * 800);
        assert_eq!(r.pool.in_use(), 0);
    }
}
