// SPDX-License-Identifier: Apache-2.0

//! Cross-context async calls. See [`AsyncCall`] and [`AsyncInbox`].
//!
//! An async call is `(routine, up to MAX_ASYNC_ARGS uintptr arguments)` packed into a
//! single MPMC ring slot, so the ring stays a uniform fixed-size element type no
//! matter which routine is being invoked - the routine itself knows how many of its
//! argument slots are meaningful.

use crate::ring::mpmc::{MpmcRing, TryPushError};

pub const MAX_ASYNC_ARGS: usize = 4;

/// A deferred call: a plain function pointer plus its packed arguments. Routines
/// receive raw `usize` slots rather than typed arguments because the inbox's ring must
/// have one fixed slot size regardless of which routine is posted; callers pack
/// pointers/handles into `usize` the same way libc-style callback APIs do.
pub struct AsyncCall {
    routine: fn(&[usize; MAX_ASYNC_ARGS]),
    args: [usize; MAX_ASYNC_ARGS],
}

impl AsyncCall {
    pub fn new(routine: fn(&[usize; MAX_ASYNC_ARGS]), args: [usize; MAX_ASYNC_ARGS]) -> Self {
        Self { routine, args }
    }

    pub fn invoke(self) { (self.routine)(&self.args) }
}

/// A context's inbox: an MPMC ring of pending [`AsyncCall`]s posted by any other
/// context (or a helper thread). Processed inside the owning strand's fiber-switch
/// loop via [`Self::drain`], and explicitly via a context's `handle_calls` entry
/// point.
pub struct AsyncInbox {
    ring: MpmcRing<AsyncCall>,
}

impl AsyncInbox {
    pub fn new(capacity: usize) -> Self { Self { ring: MpmcRing::new(capacity) } }

    /// Posts a call, blocking (spinning, then yielding the OS thread) if the inbox is
    /// momentarily full. Used by posters running on a bare OS thread (helper
    /// threads); fiber code should prefer [`Self::try_post`] and yield the fiber
    /// instead of the thread on [`TryPushError::Full`].
    pub fn post(&self, call: AsyncCall) { self.ring.push(call); }

    pub fn try_post(&self, call: AsyncCall) -> Result<(), AsyncCall> {
        match self.ring.try_push(call) {
            Ok(()) => Ok(()),
            Err(TryPushError::Full(call)) => Err(call),
        }
    }

    /// Invokes every call currently queued, in enqueue order, and returns how many ran.
    pub fn drain(&self) -> usize {
        let mut processed = 0;
        while let Ok(call) = self.ring.try_pop() {
            call.invoke();
            processed += 1;
        }
        processed
    }

    pub fn is_empty(&self) -> bool { self.ring.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static SEEN: AtomicUsize = AtomicUsize::new(0);

    fn add_arg0(args: &[usize; MAX_ASYNC_ARGS]) {
        SEEN.fetch_add(args[0], Ordering::SeqCst);
    }

    #[test]
    fn drain_invokes_in_order() {
        SEEN.store(0, Ordering::SeqCst);
        let inbox = AsyncInbox::new(8);
        inbox.try_post(AsyncCall::new(add_arg0, [1, 0, 0, 0])).unwrap();
        inbox.try_post(AsyncCall::new(add_arg0, [2, 0, 0, 0])).unwrap();
        assert_eq!(inbox.drain(), 2);
        assert_eq!(SEEN.load(Ordering::SeqCst), 3);
        assert!(inbox.is_empty());
    }

    #[test]
    fn try_post_reports_full() {
        let inbox = AsyncInbox::new(1);
        inbox.try_post(AsyncCall::new(add_arg0, [0, 0, 0, 0])).unwrap();
        assert!(inbox.try_post(AsyncCall::new(add_arg0, [0, 0, 0, 0])).is_err());
    }
}
