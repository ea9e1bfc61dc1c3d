//! Lock-free entropy pool.
//!
//! The hardware RNG produces one byte per interrupt at low priority, while
//! the link layer consumes bytes from time-critical contexts that cannot
//! wait. The pool decouples the two: the interrupt handler pushes bytes in,
//! consumers take what is available, and when the fill level drops to the
//! refill threshold the caller is told to start the generator again.
//!
//! The ring has a single producer (the interrupt handler) and supports
//! re-entrant consumers: a higher-priority consumer may preempt a lower
//! priority one mid-copy, which is why `read` is tracked separately from
//! `head`.
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// The backing state of an entropy pool.
///
/// # Safety
///
/// - When `base` is non-null, it must point to a byte slice of at least `len` bytes
/// - `head`, `tail` and `read` must be in the range `0..len`
/// - References to `base[tail]` may exist only in [`RandPool::push`]
pub struct RandPool {
    base: AtomicPtr<u8>,
    len: AtomicUsize,
    head: AtomicUsize,
    tail: AtomicUsize,
    read: AtomicUsize,
    threshold: AtomicUsize,
}

/// What the producer should do after a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Keep generating.
    More,
    /// The pool is full, stop the generator.
    Full,
    /// The pool is gone, stop the generator.
    Detached,
}

impl RandPool {
    pub const fn new() -> Self {
        RandPool {
            base: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
            threshold: AtomicUsize::new(0),
        }
    }

    /// Attach backing storage. The length of `pool` must be a power of two.
    pub fn attach(&self, pool: &'static mut [u8], threshold: usize) {
        assert!(pool.len().is_power_of_two());
        self.len.store(pool.len(), Ordering::Release);
        self.head.store(0, Ordering::Release);
        self.tail.store(0, Ordering::Release);
        self.read.store(0, Ordering::Release);
        self.threshold.store(threshold, Ordering::Release);
        self.base.store(pool.as_mut_ptr(), Ordering::Release);
    }

    /// Detach the backing storage. The producer interrupt must be disabled
    /// before this is called.
    pub fn detach(&self) {
        self.base.store(ptr::null_mut(), Ordering::Release);
        self.len.store(0, Ordering::Release);
        self.head.store(0, Ordering::Release);
        self.tail.store(0, Ordering::Release);
        self.read.store(0, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Bytes currently available to consumers.
    pub fn available(&self) -> usize {
        let capacity = self.capacity();
        if capacity == 0 {
            return 0;
        }
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        ring_len(head, tail, capacity)
    }

    /// Push one generated byte. Producer side, single caller.
    pub fn push(&self, byte: u8) -> PushOutcome {
        // Mutate the slice within a critical section so the storage cannot be
        // detached between loading the pointer and dereferencing it.
        let (stored, head, tail, len) = critical_section::with(|_| {
            let base = self.base.load(Ordering::Acquire);
            let len = self.len.load(Ordering::Acquire);
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if base.is_null() {
                (false, 0, 0, 0)
            } else {
                // Safety: non-null base means the storage is attached,
                // `tail < len`, and `push` has exclusive access to `base[tail]`.
                unsafe { *base.add(tail) = byte };
                (true, head, tail, len)
            }
        });
        if !stored {
            return PushOutcome::Detached;
        }

        let new_tail = ring_add(tail, 1, len);
        let is_full = new_tail == head || ring_add(new_tail, 1, len) == head;

        // Only advance `tail` while it stays distinct from `head`, which
        // keeps the slot at `tail` exclusive to the producer.
        if new_tail != head {
            self.tail.store(new_tail, Ordering::Release);
        }

        if is_full {
            PushOutcome::Full
        } else {
            PushOutcome::More
        }
    }

    /// Copy up to `dest.len()` bytes out of the pool.
    ///
    /// Returns the number of bytes written and whether the fill level has
    /// dropped to the refill threshold, in which case the caller should start
    /// the generator.
    pub fn try_fill_bytes(&self, dest: &mut [u8]) -> (usize, bool) {
        if dest.is_empty() {
            return (0, false);
        }
        let capacity = self.capacity();
        if capacity == 0 {
            return (0, false);
        }

        let (start, end, len, reentrant) = critical_section::with(|_| {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            let read = self.read.load(Ordering::Acquire);

            // If `read` is ahead of `head` we have preempted a lower-priority
            // consumer mid-copy.
            let reentrant = head != read;
            let available = ring_len(read, tail, capacity);
            let len = dest.len().min(available);

            let end = ring_add(read, len, capacity);
            self.read.store(end, Ordering::Release);

            (read, end, len, reentrant)
        });

        // Safety: the range `start..end` lies between `read` and `tail`, so
        // it is never aliased by the producer.
        unsafe {
            let base = self.base.load(Ordering::Acquire);
            if start <= end {
                let slice = core::slice::from_raw_parts(base.add(start), end - start);
                dest[..len].copy_from_slice(slice);
            } else {
                let first = core::slice::from_raw_parts(base.add(start), capacity - start);
                dest[..(capacity - start)].copy_from_slice(first);
                let second = core::slice::from_raw_parts(base, end);
                dest[(capacity - start)..len].copy_from_slice(second);
            }
        }

        let mut refill = false;
        if !reentrant {
            // Lowest-priority consumer publishes the new head, including any
            // bytes taken by consumers that preempted us.
            critical_section::with(|_| {
                let head = self.read.load(Ordering::Acquire);
                self.head.store(head, Ordering::Release);

                let tail = self.tail.load(Ordering::Acquire);
                let available = ring_len(head, tail, capacity);
                refill = available <= self.threshold.load(Ordering::Acquire);
            });
        }

        (len, refill)
    }
}

impl Default for RandPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Offsets `base` by `count`, wrapping at `capacity`.
///
/// Note: Only valid for capacities that are powers of two.
fn ring_add(base: usize, count: usize, capacity: usize) -> usize {
    (base + count) & (capacity - 1)
}

/// Finds the difference between `end` and `start`, wrapping around `capacity`.
///
/// Note: Only valid for capacities that are powers of two.
fn ring_len(start: usize, end: usize, capacity: usize) -> usize {
    (end + capacity - start) & (capacity - 1)
}

#[cfg(test)]
mod tests {
    use std::boxed::Box;

    use super::*;

    fn attached(threshold: usize) -> &'static RandPool {
        let pool: &'static RandPool = Box::leak(Box::new(RandPool::new()));
        let storage: &'static mut [u8] = Box::leak(Box::new([0u8; 16]));
        pool.attach(storage, threshold);
        pool
    }

    #[test]
    fn bytes_come_out_in_push_order() {
        let pool = attached(0);
        for b in 1..=8u8 {
            assert_eq!(pool.push(b), PushOutcome::More);
        }
        assert_eq!(pool.available(), 8);
        let mut out = [0u8; 5];
        let (n, _) = pool.try_fill_bytes(&mut out);
        assert_eq!(n, 5);
        assert_eq!(out, [1, 2, 3, 4, 5]);
        let mut out = [0u8; 8];
        let (n, _) = pool.try_fill_bytes(&mut out);
        assert_eq!(n, 3);
        assert_eq!(&out[..3], &[6, 7, 8]);
    }

    #[test]
    fn producer_reports_full() {
        let pool = attached(0);
        let mut outcome = PushOutcome::More;
        let mut pushed = 0;
        while outcome == PushOutcome::More {
            outcome = pool.push(0xA5);
            pushed += 1;
            assert!(pushed <= 16);
        }
        assert_eq!(outcome, PushOutcome::Full);
        // One slot stays reserved for the producer.
        assert!(pool.available() >= 14);
    }

    #[test]
    fn refill_requested_at_threshold() {
        let pool = attached(4);
        for b in 0..10u8 {
            pool.push(b);
        }
        let mut out = [0u8; 4];
        let (_, refill) = pool.try_fill_bytes(&mut out);
        assert!(!refill);
        let (_, refill) = pool.try_fill_bytes(&mut out);
        assert!(refill);
    }

    #[test]
    fn detached_pool_rejects_producer() {
        let pool = attached(0);
        pool.detach();
        assert_eq!(pool.push(0xFF), PushOutcome::Detached);
        let mut out = [0u8; 4];
        assert_eq!(pool.try_fill_bytes(&mut out), (0, false));
    }

    #[test]
    fn fill_wraps_around_the_ring() {
        let pool = attached(0);
        for b in 0..12u8 {
            pool.push(b);
        }
        let mut out = [0u8; 12];
        pool.try_fill_bytes(&mut out);
        // Head is now at 12 of 16, the next batch wraps.
        for b in 100..110u8 {
            pool.push(b);
        }
        let mut out = [0u8; 10];
        let (n, _) = pool.try_fill_bytes(&mut out);
        assert_eq!(n, 10);
        assert_eq!(out, [100, 101, 102, 103, 104, 105, 106, 107, 108, 109]);
    }
}
