// SPDX-License-Identifier: Apache-2.0

//! Single-executor-lock combiner over a bounded MPMC ring. See [`Combiner`].
//!
//! Under contention, exactly one thread performs all updates at a time; every other
//! caller pays only the cost of an enqueue. This amortizes the cost of an exclusive
//! critical section across many callers and avoids the thundering-herd wake-up pattern
//! of a plain mutex.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::common::Backoff;
use crate::ring::mpmc::{MpmcRing, TryPopError};

thread_local! {
    /// Addresses of combiners whose executor lock this thread currently holds. Used
    /// only to catch accidental re-entrant `execute` calls from within a combining
    /// routine, which the design does not support (see the combiner recursion open
    /// question).
    static HELD_COMBINERS: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

struct Message<T> {
    argument: T,
    done: Option<Arc<AtomicBool>>,
}

/// Serializes calls to `routine` through a single executor, draining up to `handoff`
/// queued calls per critical-section entry.
///
/// `routine` must not call [`Self::execute`] on the same combiner from within itself;
/// debug builds assert against this (see [`DESIGN.md`]'s Open Question decisions).
pub struct Combiner<T, F> {
    routine: F,
    ring: MpmcRing<Message<T>>,
    executor_lock: AtomicBool,
    handoff: usize,
}

impl<T, F> Combiner<T, F>
where
    F: Fn(&T),
{
    /// Creates a combiner. `capacity` must be a power of two; `handoff` must be at
    /// least 4 (the spec's minimum drain bound).
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of two or `handoff < 4`.
    pub fn new(routine: F, capacity: usize, handoff: usize) -> Self {
        assert!(handoff >= 4, "handoff must be at least 4");
        Self {
            routine,
            ring: MpmcRing::new(capacity),
            executor_lock: AtomicBool::new(false),
            handoff,
        }
    }

    fn self_addr(&self) -> usize { self as *const Self as usize }

    fn try_acquire(&self) -> bool {
        self.executor_lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn release(&self) { self.executor_lock.store(false, Ordering::Release); }

    /// Runs `routine(&argument)`, either directly (if this thread becomes the
    /// executor) or after enqueueing it for whichever thread currently is. If `wait`
    /// is true, blocks until the routine has actually run on `argument` before
    /// returning.
    pub fn execute(&self, argument: T, wait: bool) {
        let addr = self.self_addr();
        debug_assert!(
            !HELD_COMBINERS.with(|held| held.borrow().contains(&addr)),
            "combiner routine recursively called execute() on its own combiner"
        );

        if self.try_acquire() {
            HELD_COMBINERS.with(|held| held.borrow_mut().push(addr));
            (self.routine)(&argument);
            self.drain_locked();
            HELD_COMBINERS.with(|held| held.borrow_mut().retain(|a| *a != addr));
            self.release();
            return;
        }

        let done = wait.then(|| Arc::new(AtomicBool::new(false)));
        self.ring.push(Message {
            argument,
            done: done.clone(),
        });

        if let Some(done) = done {
            let mut backoff = Backoff::new();
            while !done.load(Ordering::Acquire) {
                if backoff.snooze() {
                    std::thread::yield_now();
                    backoff.reset();
                }
            }
        }
    }

    /// Drains up to `handoff` queued messages while the executor lock is held.
    fn drain_locked(&self) {
        for _ in 0..self.handoff {
            match self.ring.try_pop() {
                Ok(message) => {
                    (self.routine)(&message.argument);
                    if let Some(done) = message.done {
                        done.store(true, Ordering::Release);
                    }
                }
                Err(TryPopError::Empty) => break,
            }
        }
    }

    /// Number of calls currently queued for the executor to pick up.
    pub fn pending(&self) -> bool { !self.ring.is_empty() }
}
