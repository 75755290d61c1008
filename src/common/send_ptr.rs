// SPDX-License-Identifier: Apache-2.0

//! A raw pointer wrapper that is explicitly asserted `Send`. See [`SendPtr`].

/// Wraps a `*mut T` so it can be captured by a `Send` closure.
///
/// A bare raw pointer is never `Send`, even when the data it points to is only ever
/// touched from one thread at a time - the compiler has no way to see that invariant.
/// `SendPtr` exists for exactly that case: callers that know (and document) the
/// pointer is dereferenced only on the thread that is guaranteed to own it, such as a
/// `*mut Strand` captured by a timer callback that only ever runs on the one context
/// thread that armed the timer (§5: "Per-listener change buffers... and timer queue
/// are owned exclusively by that listener's fiber context").
#[derive(Debug, Clone, Copy)]
pub struct SendPtr<T>(pub *mut T);

// SAFETY: `SendPtr` only ever crosses the Send boundary at the point a containing
// closure/struct is moved (e.g. handed to `TimerQueue::arm`, or a `Context` moved once
// into its worker thread at spawn time); the pointee itself is never accessed from any
// thread other than the one the caller has already established as its sole owner. It
// is the caller's responsibility to uphold that, same as any other raw-pointer
// dereference in this crate.
unsafe impl<T> Send for SendPtr<T> {}

impl<T> SendPtr<T> {
    pub fn new(ptr: *mut T) -> Self { Self(ptr) }

    /// # Safety
    ///
    /// The pointee must still be valid and exclusively owned by the thread calling
    /// this, per the invariant documented on [`SendPtr`] itself.
    pub unsafe fn get(self) -> *mut T { self.0 }
}
