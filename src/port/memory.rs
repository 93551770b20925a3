use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use crate::clock::Clock;
use crate::packet::{Packet, PacketPool};
use crate::port::{Port, SendOutcome};

/// A frame that left through a [`MemoryPort`], with the clock reading at
/// the time it was accepted.
#[derive(Debug, Clone)]
pub struct Transmitted {
    pub data: Bytes,
    pub at: u64,
}

/// In-process port: frames are injected by hand and transmissions are
/// recorded. Used for tests and for running the pipeline without NICs.
pub struct MemoryPort {
    name: String,
    pool: Arc<PacketPool>,
    clock: Option<Arc<dyn Clock>>,
    rx: Mutex<VecDeque<Bytes>>,
    tx: Mutex<Vec<Transmitted>>,
    accept_limit: Mutex<Option<usize>>,
    mtu: Mutex<Option<usize>>,
    no_buffer: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryPort {
    pub fn new(name: impl Into<String>, pool: Arc<PacketPool>) -> Self {
        Self {
            name: name.into(),
            pool,
            clock: None,
            rx: Mutex::new(VecDeque::new()),
            tx: Mutex::new(Vec::new()),
            accept_limit: Mutex::new(None),
            mtu: Mutex::new(None),
            no_buffer: AtomicU64::new(0),
        }
    }

    /// Record transmit times with `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn inject<I: IntoIterator<Item = Bytes>>(&self, frames: I) {
        lock(&self.rx).extend(frames);
    }

    pub fn pending_rx(&self) -> usize {
        lock(&self.rx).len()
    }

    /// Cap how many packets a single `send_burst` accepts.
    pub fn set_accept_limit(&self, limit: Option<usize>) {
        *lock(&self.accept_limit) = limit;
    }

    /// Refuse frames longer than `mtu` bytes, as a device would.
    pub fn set_mtu(&self, mtu: Option<usize>) {
        *lock(&self.mtu) = mtu;
    }

    pub fn transmitted_count(&self) -> usize {
        lock(&self.tx).len()
    }

    pub fn take_transmitted(&self) -> Vec<Transmitted> {
        std::mem::take(&mut *lock(&self.tx))
    }
}

impl Port for MemoryPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn receive_burst(&self, out: &mut Vec<Packet>, max: usize) -> usize {
        let mut rx = lock(&self.rx);
        let mut received = 0;
        while received < max {
            let Some(frame) = rx.pop_front() else { break };
            match Packet::new(&self.pool, frame) {
                Ok(pkt) => {
                    out.push(pkt);
                    received += 1;
                }
                Err(_) => {
                    self.no_buffer.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        received
    }

    fn send_burst(&self, packets: &[Packet]) -> SendOutcome {
        let limit = lock(&self.accept_limit).unwrap_or(usize::MAX);
        let mtu = lock(&self.mtu).unwrap_or(usize::MAX);
        let at = self.clock.as_ref().map_or(0, |c| c.now());
        let mut tx = lock(&self.tx);
        for (i, pkt) in packets.iter().enumerate() {
            if i == limit {
                return SendOutcome::sent(i);
            }
            if pkt.len() > mtu {
                return SendOutcome::rejected_after(i);
            }
            tx.push(Transmitted {
                data: Bytes::copy_from_slice(pkt.payload()),
                at,
            });
        }
        SendOutcome::sent(packets.len())
    }

    fn rx_no_buffer(&self) -> u64 {
        self.no_buffer.load(Ordering::Relaxed)
    }
}
