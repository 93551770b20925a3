// ==========================================
// Bounded single-producer / single-consumer ring
// ==========================================
//
// Every inter-stage hop is one of these. The producer owns `head`, the
// consumer owns `tail`; each side keeps a cached copy of the other's index
// and only crosses cores when the cache says the ring is full or empty.
//
// Capacity is exact: slots are rounded up to a power of two for masking,
// but occupancy never exceeds the requested capacity.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Keeps a value on its own pair of cache lines (the adjacent-line
/// prefetcher pulls 128 bytes at a time).
#[repr(C, align(128))]
pub struct CachePadded<T> {
    pub(crate) value: T,
}

impl<T> CachePadded<T> {
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

struct Ring<T> {
    head: CachePadded<AtomicUsize>, // written by producer
    tail: CachePadded<AtomicUsize>, // written by consumer
    capacity: usize,
    mask: usize,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: a slot is touched by the producer only while it is outside
// [tail, head) and by the consumer only while it is inside; the Release/Acquire
// pairs on head and tail order those accesses.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    #[inline(always)]
    fn slot(&self, index: usize) -> *mut MaybeUninit<T> {
        self.slots[index & self.mask].get()
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        // Both halves are gone; whatever is still queued is freed here.
        let head = *self.head.value.get_mut();
        let mut tail = *self.tail.value.get_mut();
        while tail != head {
            // SAFETY: slots in [tail, head) were initialised by the producer
            // and never read by the consumer.
            unsafe { (*self.slot(tail)).assume_init_drop() };
            tail = tail.wrapping_add(1);
        }
    }
}

pub struct Producer<T> {
    ring: Arc<Ring<T>>,
    head: usize,
    cached_tail: usize,
}

pub struct Consumer<T> {
    ring: Arc<Ring<T>>,
    tail: usize,
    cached_head: usize,
}

/// Create a queue holding at most `capacity` items.
pub fn bounded<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(capacity > 0, "queue capacity must be non-zero");
    let slots = capacity.next_power_of_two();
    let buffer = (0..slots)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let ring = Arc::new(Ring {
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
        capacity,
        mask: slots - 1,
        slots: buffer,
    });
    (
        Producer {
            ring: ring.clone(),
            head: 0,
            cached_tail: 0,
        },
        Consumer {
            ring,
            tail: 0,
            cached_head: 0,
        },
    )
}

impl<T> Producer<T> {
    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }

    /// Free slots as of now.
    pub fn free(&mut self) -> usize {
        self.cached_tail = self.ring.tail.value.load(Ordering::Acquire);
        self.ring.capacity - self.head.wrapping_sub(self.cached_tail)
    }

    /// Move as many items as fit from the front of `batch` into the queue.
    ///
    /// Returns the number accepted. The rejected suffix stays in `batch`, in
    /// order; the caller decides how to dispose of it.
    pub fn push_burst(&mut self, batch: &mut Vec<T>) -> usize {
        let n = batch.len();
        if n == 0 {
            return 0;
        }
        let mut free = self.ring.capacity - self.head.wrapping_sub(self.cached_tail);
        if free < n {
            free = self.free();
        }
        let accepted = n.min(free);
        if accepted == 0 {
            return 0;
        }
        for (i, item) in batch.drain(..accepted).enumerate() {
            // SAFETY: the slot lies outside [tail, head) so the consumer
            // cannot observe it until head is published below.
            unsafe { (*self.ring.slot(self.head.wrapping_add(i))).write(item) };
        }
        self.head = self.head.wrapping_add(accepted);
        self.ring.head.value.store(self.head, Ordering::Release);
        accepted
    }

    /// Push a burst and free whatever does not fit. Returns the number freed.
    pub fn push_burst_or_free(&mut self, batch: &mut Vec<T>) -> usize {
        self.push_burst(batch);
        let rejected = batch.len();
        batch.clear();
        rejected
    }

    /// Single-item push; hands the item back when the queue is full.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        if self.ring.capacity == self.head.wrapping_sub(self.cached_tail) && self.free() == 0 {
            return Err(item);
        }
        // SAFETY: see push_burst.
        unsafe { (*self.ring.slot(self.head)).write(item) };
        self.head = self.head.wrapping_add(1);
        self.ring.head.value.store(self.head, Ordering::Release);
        Ok(())
    }
}

impl<T> Consumer<T> {
    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }

    /// Items available as of now.
    pub fn len(&mut self) -> usize {
        self.cached_head = self.ring.head.value.load(Ordering::Acquire);
        self.cached_head.wrapping_sub(self.tail)
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Append up to `max` items, oldest first, to `out`.
    pub fn pop_burst<E: Extend<T>>(&mut self, out: &mut E, max: usize) -> usize {
        if max == 0 {
            return 0;
        }
        let mut available = self.cached_head.wrapping_sub(self.tail);
        if available < max {
            available = self.len();
        }
        let taken = available.min(max);
        if taken == 0 {
            return 0;
        }
        let ring = &self.ring;
        let tail = self.tail;
        out.extend((0..taken).map(|i| {
            // SAFETY: the slot lies inside [tail, head); it was initialised
            // before head was published and is read exactly once.
            unsafe { (*ring.slot(tail.wrapping_add(i))).assume_init_read() }
        }));
        self.tail = self.tail.wrapping_add(taken);
        self.ring.tail.value.store(self.tail, Ordering::Release);
        taken
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.cached_head == self.tail && self.len() == 0 {
            return None;
        }
        // SAFETY: see pop_burst.
        let item = unsafe { (*self.ring.slot(self.tail)).assume_init_read() };
        self.tail = self.tail.wrapping_add(1);
        self.ring.tail.value.store(self.tail, Ordering::Release);
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_fifo_order_single_items() {
        let (mut tx, mut rx) = bounded(4);
        for i in 0..4 {
            assert!(tx.push(i).is_ok());
        }
        assert_eq!(tx.push(99), Err(99));
        assert_eq!(rx.pop(), Some(0));
        assert!(tx.push(4).is_ok());
        let mut out = Vec::new();
        assert_eq!(rx.pop_burst(&mut out, 16), 4);
        assert_eq!(out, vec![1, 2, 3, 4]);
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn test_capacity_not_power_of_two_is_exact() {
        let (mut tx, mut rx) = bounded(5);
        let mut batch: Vec<u32> = (0..8).collect();
        assert_eq!(tx.push_burst(&mut batch), 5);
        assert_eq!(batch, vec![5, 6, 7]);
        assert_eq!(tx.free(), 0);
        assert_eq!(rx.len(), 5);
    }

    #[test]
    fn test_overflow_frees_exactly_the_excess() {
        const CAPACITY: usize = 512;
        let (mut tx, mut rx) = bounded(CAPACITY);
        let mut batch: Vec<usize> = (0..CAPACITY + 50).collect();
        let dropped = tx.push_burst_or_free(&mut batch);
        assert_eq!(dropped, 50);
        assert!(batch.is_empty());

        let mut out = Vec::new();
        rx.pop_burst(&mut out, usize::MAX);
        assert_eq!(out.len(), CAPACITY);
        assert_eq!(out.first(), Some(&0));
        assert_eq!(out.last(), Some(&(CAPACITY - 1)));
    }

    #[test]
    fn test_wraparound_keeps_order() {
        let (mut tx, mut rx) = bounded(3);
        let mut out = Vec::new();
        for round in 0..100u32 {
            let mut batch = vec![round * 2, round * 2 + 1];
            assert_eq!(tx.push_burst(&mut batch), 2);
            out.clear();
            assert_eq!(rx.pop_burst(&mut out, 8), 2);
            assert_eq!(out, vec![round * 2, round * 2 + 1]);
        }
    }

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_queued_items_are_freed_with_the_queue() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (mut tx, mut rx) = bounded(8);
        let mut batch: Vec<_> = (0..6).map(|_| Tracked(drops.clone())).collect();
        tx.push_burst(&mut batch);
        let mut out = Vec::new();
        rx.pop_burst(&mut out, 2);
        drop(out);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        drop(tx);
        drop(rx);
        assert_eq!(drops.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_cross_thread_transfer_preserves_order() {
        const N: u64 = 200_000;
        let (mut tx, mut rx) = bounded::<u64>(1024);
        let producer = std::thread::spawn(move || {
            let mut next = 0;
            let mut batch = Vec::new();
            while next < N {
                batch.extend(next..(next + 64).min(N));
                let accepted = tx.push_burst(&mut batch);
                next += accepted as u64;
                batch.clear();
                std::hint::spin_loop();
            }
        });

        let mut expected = 0;
        let mut out = Vec::new();
        while expected < N {
            out.clear();
            rx.pop_burst(&mut out, 256);
            for v in &out {
                assert_eq!(*v, expected);
                expected += 1;
            }
        }
        producer.join().unwrap();
    }
}
