// SPDX-License-Identifier: Apache-2.0

//! Fiber wait-sets. See [`SharedWaitSet`] and [`UniqueWaitSet`].
//!
//! Both flavors only track *which* fiber is waiting; actually blocking and waking a
//! fiber is [`crate::fiber::Strand::block_now`]/[`crate::fiber::Strand::run`]'s job.
//! Callers pair a wait-set operation with the matching strand call under whatever lock
//! protects the resource the fiber is waiting on (the spec's "caller-provided lock").

use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::fiber::FiberId;

/// A LIFO of waiting fibers, guarded by an internal mutex standing in for the
/// caller-provided lock the spec describes (in this port, the wait-set's own mutex
/// *is* that lock - callers take it once and perform both their resource check and
/// the wait-set push/pop while holding it by going through [`Self::with_lock`]).
#[derive(Default)]
pub struct SharedWaitSet {
    entries: Mutex<Vec<FiberId>>,
}

impl SharedWaitSet {
    pub fn new() -> Self { Self { entries: Mutex::new(Vec::new()) } }

    /// Registers `fiber` as waiting. The caller must block the fiber itself
    /// immediately after, while still holding whatever external state this wait-set
    /// is synchronizing.
    pub fn enqueue(&self, fiber: FiberId) {
        self.entries.lock().expect("wait-set mutex poisoned").push(fiber);
    }

    /// Removes `fiber` if still present (used to cancel a timed wait whose timeout
    /// fired before it was woken). Returns whether it was found.
    pub fn remove(&self, fiber: FiberId) -> bool {
        let mut guard = self.entries.lock().expect("wait-set mutex poisoned");
        if let Some(pos) = guard.iter().position(|candidate| *candidate == fiber) {
            guard.remove(pos);
            true
        } else {
            false
        }
    }

    /// Drains every currently waiting fiber for the caller to run. Returns an empty
    /// vector if none were waiting.
    pub fn broadcast_all(&self) -> Vec<FiberId> {
        let mut guard = self.entries.lock().expect("wait-set mutex poisoned");
        std::mem::take(&mut *guard)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().expect("wait-set mutex poisoned").is_empty()
    }
}

/// A single-waiter, single-signal one-shot wait-set, implemented lock-free with a
/// store-load fence rather than a mutex.
///
/// Protocol: the waiter publishes its fiber id via [`Self::prepare_wait`] *before*
/// checking whether it was already signaled; the waker stores the signaled flag via
/// [`Self::signal`] *before* consulting the fiber id. The fence between each pair of
/// operations rules out the reordering that would otherwise let both sides miss each
/// other (waiter blocks after the waker already gave up looking for it, or waker signals
/// before the waiter has published itself and the waiter then blocks forever).
pub struct UniqueWaitSet {
    /// `0` means no fiber has published itself; otherwise `fiber_id + 1`.
    fiber: AtomicU64,
    signaled: AtomicBool,
}

impl UniqueWaitSet {
    pub const fn new() -> Self {
        Self {
            fiber: AtomicU64::new(0),
            signaled: AtomicBool::new(false),
        }
    }

    /// Publishes `fiber` as the waiter. Call this, then check
    /// [`Self::should_skip_block`] before actually blocking the fiber.
    pub fn prepare_wait(&self, fiber: FiberId) {
        self.fiber.store(fiber.0 as u64 + 1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
    }

    /// Returns `true` if a signal already arrived between `prepare_wait` and this
    /// call, meaning the waiter must not block (it would never be woken).
    pub fn should_skip_block(&self) -> bool { self.signaled.swap(false, Ordering::Acquire) }

    /// Signals the wait-set. Returns the waiting fiber to run, if one had already
    /// published itself via `prepare_wait`.
    pub fn signal(&self) -> Option<FiberId> {
        self.signaled.store(true, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let raw = self.fiber.swap(0, Ordering::Acquire);
        (raw != 0).then(|| FiberId((raw - 1) as u32))
    }
}

impl Default for UniqueWaitSet {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_wait_set_broadcast_drains_all() {
        let set = SharedWaitSet::new();
        set.enqueue(FiberId(1));
        set.enqueue(FiberId(2));
        set.enqueue(FiberId(3));
        let woken = set.broadcast_all();
        assert_eq!(woken, vec![FiberId(1), FiberId(2), FiberId(3)]);
        assert!(set.is_empty());
    }

    #[test]
    fn shared_wait_set_remove_cancels_timed_wait() {
        let set = SharedWaitSet::new();
        set.enqueue(FiberId(1));
        assert!(set.remove(FiberId(1)));
        assert!(!set.remove(FiberId(1)));
        assert!(set.broadcast_all().is_empty());
    }

    #[test]
    fn unique_wait_set_signal_after_prepare_returns_fiber() {
        let set = UniqueWaitSet::new();
        set.prepare_wait(FiberId(7));
        assert!(!set.should_skip_block());
        assert_eq!(set.signal(), Some(FiberId(7)));
    }

    #[test]
    fn unique_wait_set_signal_before_prepare_is_observed_as_skip() {
        let set = UniqueWaitSet::new();
        assert_eq!(set.signal(), None);
        assert!(set.should_skip_block());
    }
}
