use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use thiserror::Error;

use crate::ring::CachePadded;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("packet pool exhausted ({capacity} buffers in use)")]
pub struct PoolExhausted {
    pub capacity: usize,
}

// ==========================================
// Buffer pool
// ==========================================

/// Upper bound on live packet buffers, shared by every core.
///
/// Acquire and release are one atomic RMW each; there is no lock and no
/// retry loop.
pub struct PacketPool {
    capacity: usize,
    in_use: CachePadded<AtomicUsize>,
}

impl PacketPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            in_use: CachePadded::new(AtomicUsize::new(0)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use.value.load(Ordering::Relaxed)
    }

    fn acquire(self: &Arc<Self>) -> Result<Lease, PoolExhausted> {
        let prev = self.in_use.value.fetch_add(1, Ordering::AcqRel);
        if prev >= self.capacity {
            self.in_use.value.fetch_sub(1, Ordering::AcqRel);
            return Err(PoolExhausted {
                capacity: self.capacity,
            });
        }
        Ok(Lease(self.clone()))
    }
}

impl fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketPool")
            .field("capacity", &self.capacity)
            .field("in_use", &self.in_use())
            .finish()
    }
}

struct Lease(Arc<PacketPool>);

impl Drop for Lease {
    fn drop(&mut self) {
        self.0.in_use.value.fetch_sub(1, Ordering::AcqRel);
    }
}

// ==========================================
// Packet handle
// ==========================================

/// Owned handle to one captured frame.
///
/// Exactly one stage holds a `Packet` at a time; dropping it returns the
/// buffer to the pool. Clones made by [`Packet::try_clone`] share the payload
/// bytes but hold their own pool slot.
pub struct Packet {
    data: Bytes,
    arrival: u64,
    _lease: Lease,
}

impl Packet {
    pub fn new(pool: &Arc<PacketPool>, data: Bytes) -> Result<Self, PoolExhausted> {
        Ok(Self {
            data,
            arrival: 0,
            _lease: pool.acquire()?,
        })
    }

    pub fn try_clone(&self) -> Result<Self, PoolExhausted> {
        Ok(Self {
            data: self.data.clone(),
            arrival: self.arrival,
            _lease: self._lease.0.acquire()?,
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len_bits(&self) -> u64 {
        self.data.len() as u64 * 8
    }

    /// Cycle count at which the packet was admitted to the delay queue.
    pub fn arrival(&self) -> u64 {
        self.arrival
    }

    pub fn stamp(&mut self, now: u64) {
        self.arrival = now;
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.data.len())
            .field("arrival", &self.arrival)
            .finish()
    }
}
