// SPDX-License-Identifier: Apache-2.0

//! Single-producer/single-consumer ring specialization. See [`SpscRing`].
//!
//! Shares the stamped-slot layout with [`super::mpmc::MpmcRing`], but since there is
//! exactly one producer and one consumer, claiming a slot never needs a
//! `compare_exchange`: the producer is the only writer of `tail` and the consumer the
//! only writer of `head`, so a plain load-then-store suffices.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::{Backoff, CachePadded};

struct Slot<T> {
    stamp: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

pub struct SpscRing<T> {
    mask: u64,
    buffer: Box<[Slot<T>]>,
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
}

// SAFETY: the producer side is only ever touched from the single designated producer
// and the consumer side only from the single designated consumer; `Sync` is needed so
// an `Arc<SpscRing<T>>` can be shared between exactly those two threads.
unsafe impl<T: Send> Send for SpscRing<T> {}
unsafe impl<T: Send> Sync for SpscRing<T> {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryPushError<T> {
    Full(T),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryPopError {
    Empty,
}

impl<T> SpscRing<T> {
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

    /// Must only be called from the single producer thread/fiber.
    pub fn try_push(&self, value: T) -> Result<(), TryPushError<T>> {
        let pos = self.tail.load(Ordering::Relaxed);
        let slot = &self.buffer[(pos & self.mask) as usize];
        let stamp = slot.stamp.load(Ordering::Acquire);
        if stamp != pos {
            return Err(TryPushError::Full(value));
        }
        // SAFETY: single-producer invariant - no other thread writes `slot.value` or
        // advances `tail`.
        unsafe { (*slot.value.get()).write(value) };
        slot.stamp.store(pos + 1, Ordering::Release);
        self.tail.store(pos + 1, Ordering::Relaxed);
        Ok(())
    }

    /// Must only be called from the single consumer thread/fiber.
    pub fn try_pop(&self) -> Result<T, TryPopError> {
        let pos = self.head.load(Ordering::Relaxed);
        let slot = &self.buffer[(pos & self.mask) as usize];
        let stamp = slot.stamp.load(Ordering::Acquire);
        if stamp != pos + 1 {
            return Err(TryPopError::Empty);
        }
        // SAFETY: single-consumer invariant - no other thread reads `slot.value` or
        // advances `head`.
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.stamp
            .store(pos.wrapping_add(self.mask + 1), Ordering::Release);
        self.head.store(pos + 1, Ordering::Relaxed);
        Ok(value)
    }

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

impl<T> Drop for SpscRing<T> {
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
        let ring = SpscRing::new(4);
        ring.try_push(10u32).unwrap();
        ring.try_push(20).unwrap();
        assert_eq!(ring.try_pop().unwrap(), 10);
        assert_eq!(ring.try_pop().unwrap(), 20);
        assert_eq!(ring.try_pop(), Err(TryPopError::Empty));
    }

    #[test]
    fn capacity_one_still_works() {
        let ring = SpscRing::new(1);
        ring.try_push(1u32).unwrap();
        assert_eq!(ring.try_push(2), Err(TryPushError::Full(2)));
        assert_eq!(ring.try_pop().unwrap(), 1);
        ring.try_push(3).unwrap();
        assert_eq!(ring.try_pop().unwrap(), 3);
    }

    #[test]
    fn sequence_preserved_across_threads_under_delay() {
        let ring = Arc::new(SpscRing::<u64>::new(256));
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
