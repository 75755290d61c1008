// SPDX-License-Identifier: Apache-2.0

//! Bounded lock-free multi-producer/multi-consumer ring buffer. See [`MpmcRing`].
//!
//! Implements the stamped-slot design from §3/§4.1: each slot carries its own sequence
//! number so producers and consumers only ever contend on a single `compare_exchange`
//! of the shared `tail`/`head` cursor, never on the slot itself. A slot's stamp having
//! advanced past the claimed position is what makes the ring wait-free in the
//! uncontended case and lock-free under contention.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::{Backoff, CachePadded};

struct Slot<T> {
    stamp: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A bounded MPMC ring of power-of-two capacity `N`.
///
/// `push`/`pop` block the calling OS thread (spinning, then yielding) until room or a
/// value is available. `try_push`/`try_pop` never block; fiber-aware callers use the
/// `try_*` forms and yield the *fiber* (not the OS thread) between attempts, which is
/// how the async-call inbox (§4.8) and the combiner (§4.2) are driven from inside the
/// strand loop.
pub struct MpmcRing<T> {
    mask: u64,
    buffer: Box<[Slot<T>]>,
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
}

// SAFETY: access to each slot's `value` is gated by the stamp protocol below, which
// establishes exclusive access to a slot between a successful claim and its publish.
unsafe impl<T: Send> Send for MpmcRing<T> {}
unsafe impl<T: Send> Sync for MpmcRing<T> {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryPushError<T> {
    Full(T),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryPopError {
    Empty,
}

impl<T> MpmcRing<T> {
    /// Creates a ring with the given capacity, which must be a power of two.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or not a power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");
        let buffer = (0..capacity)
            .map(|i| Slot {
                stamp: AtomicU64::new(i as u64),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            mask: (capacity - 1) as u64,
            buffer,
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
        }
    }

    pub fn capacity(&self) -> usize { self.mask as usize + 1 }

    /// Attempts to enqueue `value` without blocking. Returns the value back on
    /// [`TryPushError::Full`] if the ring has no free slot right now.
    pub fn try_push(&self, value: T) -> Result<(), TryPushError<T>> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[(pos & self.mask) as usize];
            let stamp = slot.stamp.load(Ordering::Acquire);
            let diff = stamp as i64 - pos as i64;

            if diff == 0 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: claiming `pos` via the stamp protocol gives this
                        // thread exclusive access to `slot.value` until it publishes
                        // `stamp = pos + 1` below.
                        unsafe { (*slot.value.get()).write(value) };
                        slot.stamp.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(observed) => pos = observed,
                }
            } else if diff < 0 {
                return Err(TryPushError::Full(value));
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Attempts to dequeue without blocking. Returns [`TryPopError::Empty`] if no
    /// value is ready right now.
    pub fn try_pop(&self) -> Result<T, TryPopError> {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[(pos & self.mask) as usize];
            let stamp = slot.stamp.load(Ordering::Acquire);
            let diff = stamp as i64 - (pos as i64 + 1);

            if diff == 0 {
                match self.head.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: symmetric to try_push - claiming `pos` on `head`
                        // gives exclusive read access until the stamp is republished
                        // for the next lap.
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.stamp
                            .store(pos.wrapping_add(self.mask + 1), Ordering::Release);
                        return Ok(value);
                    }
                    Err(observed) => pos = observed,
                }
            } else if diff < 0 {
                return Err(TryPopError::Empty);
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Enqueues `value`, spinning with escalating back-off and finally yielding the OS
    /// thread until a slot is free. Intended for callers on a bare OS thread (e.g. the
    /// blocking-syscall helper threads); fiber code should use [`Self::try_push`] and
    /// yield the fiber instead of the thread.
    pub fn push(&self, mut value: T) {
        let mut backoff = Backoff::new();
        loop {
            match self.try_push(value) {
                Ok(()) => return,
                Err(TryPushError::Full(returned)) => {
                    value = returned;
                    if backoff.snooze() {
                        std::thread::yield_now();
                        backoff.reset();
                    }
                }
            }
        }
    }

    /// Dequeues a value, spinning with escalating back-off and finally yielding the OS
    /// thread until one is available.
    pub fn pop(&self) -> T {
        let mut backoff = Backoff::new();
        loop {
            match self.try_pop() {
                Ok(value) => return value,
                Err(TryPopError::Empty) => {
                    if backoff.snooze() {
                        std::thread::yield_now();
                        backoff.reset();
                    }
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }
}

impl<T> Drop for MpmcRing<T> {
    fn drop(&mut self) {
        while self.try_pop().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn round_trip_single_thread() {
        let ring = MpmcRing::new(4);
        ring.try_push(1u32).unwrap();
        ring.try_push(2).unwrap();
        assert_eq!(ring.try_pop().unwrap(), 1);
        assert_eq!(ring.try_pop().unwrap(), 2);
        assert_eq!(ring.try_pop(), Err(TryPopError::Empty));
    }

    #[test]
    fn reports_full() {
        let ring = MpmcRing::new(2);
        ring.try_push(1u32).unwrap();
        ring.try_push(2).unwrap();
        assert_eq!(ring.try_push(3), Err(TryPushError::Full(3)));
    }

    #[test]
    fn mpmc_sum_preserved_under_contention() {
        let ring = Arc::new(MpmcRing::<u32>::new(64));
        let producers: Vec<_> = (0..4)
            .map(|_| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for _ in 0..25_000 {
                        ring.push(1);
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    let mut sum = 0u32;
                    for _ in 0..25_000 {
                        sum += ring.pop();
                    }
                    sum
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }
        let total: u32 = consumers.into_iter().map(|c| c.join().unwrap()).sum();
        assert_eq!(total, 100_000);
    }

    #[test]
    fn spsc_sequence_preserved_under_delay() {
        let ring = Arc::new(MpmcRing::<u64>::new(1024));
        let producer_ring = Arc::clone(&ring);
        let producer = thread::spawn(move || {
            for i in 1..=100_000u64 {
                for _ in 0..250 {
                    std::hint::spin_loop();
                }
                producer_ring.push(i);
            }
        });

        let mut expected = 1u64;
        for _ in 1..=100_000u64 {
            assert_eq!(ring.pop(), expected);
            expected += 1;
        }
        producer.join().unwrap();
    }
}
