// SPDX-License-Identifier: Apache-2.0

//! The pluggable allocator arena (§6). See [`Arena`], [`PrivateArena`], and
//! [`CommonArena`].
//!
//! The core never calls the global allocator directly for the memory a fiber or
//! collaborator layer requests at runtime; it goes through an [`Arena`] trait object so
//! an embedder's dlmalloc-style segregated heap can be swapped in without touching
//! anything above this module. Two concrete variants ship here, matching §5's "Shared
//! resource policy": [`PrivateArena`] (single-context, no lock, one owner thread) and
//! [`CommonArena`] (process-wide, guarded by a thread spinlock represented here as a
//! [`std::sync::Mutex`]). Segregated size-class caches, chunk lists, and region
//! allocators are explicitly a collaborator-layer concern (§6) and have no
//! counterpart here.

use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::ring::spsc::SpscRing;

/// A pluggable allocator surface: `{alloc, calloc, realloc, free, aligned_alloc,
/// bulk_free, trim}` from §6, expressed as a Rust trait over [`Layout`] rather than a
/// C vtable (§9's "replace macro-driven virtual tables with a sum type").
///
/// # Safety
///
/// Implementations must uphold the same contract as [`GlobalAlloc`]: pointers
/// returned from `alloc`/`calloc`/`aligned_alloc` must only be passed back to `free`
/// or `realloc` on the *same* arena instance, with a matching `layout`.
pub unsafe trait Arena {
    /// Allocates uninitialized memory for `layout`. Returns `None` on allocation
    /// failure (the caller maps this to [`crate::error::FatalReason::StackExhausted`]
    /// or an equivalent fatal path at the call site, per §7 case 1; the arena itself
    /// never aborts).
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Allocates zeroed memory for `layout`.
    fn calloc(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Allocates memory for `layout` aligned to at least `layout.align()`. Identical
    /// to [`Self::alloc`] here since [`Layout`] already carries an alignment; kept as
    /// a distinct method to mirror the §6 surface the spec names explicitly.
    fn aligned_alloc(&self, layout: Layout) -> Option<NonNull<u8>> { self.alloc(layout) }

    /// Resizes a previous allocation. `old_layout` must match the layout used to
    /// obtain `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by a prior call to `alloc`/`calloc`/
    /// `aligned_alloc`/`realloc` on `self` with `old_layout`, and not yet freed.
    unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>>;

    /// Frees memory previously returned by this arena.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by a prior call to `alloc`/`calloc`/
    /// `aligned_alloc`/`realloc` on `self` with `layout`, and not freed since.
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout);

    /// Frees a batch of allocations in one call, amortizing lock acquisition for
    /// arenas that need one (§6's `bulk_free`).
    ///
    /// # Safety
    ///
    /// Every `(ptr, layout)` pair must satisfy the same contract as [`Self::free`].
    unsafe fn bulk_free(&self, items: &[(NonNull<u8>, Layout)]) {
        for &(ptr, layout) in items {
            // SAFETY: forwarded from the caller's per-item contract.
            unsafe { self.free(ptr, layout) };
        }
    }

    /// Returns unused pages to the OS where the underlying allocator supports it.
    /// A no-op default for arenas backed by an allocator with no such hook.
    fn trim(&self) {}
}

/// Single-context arena with no internal locking: safe only because exactly one
/// context's strand ever calls into it. A private arena additionally owns a bounded
/// SPSC queue (§5) so peer contexts can hand back pointers allocated here without
/// taking a lock; the owning context drains that queue and frees them itself on its
/// own thread, preserving the "no lock" invariant.
pub struct PrivateArena {
    reclaim_queue: SpscRing<(NonNull<u8>, Layout)>,
}

// SAFETY: `PrivateArena` performs no internal synchronization on the allocator itself
// (that's the point - it's only ever called from its single owning context), but the
// reclaim queue is a proper SPSC ring, so handing a `NonNull<u8>` back across threads
// through `return_to_owner` is sound. The type is `Send` so it can be built on one
// thread and moved into the worker thread that will own it; it is deliberately *not*
// `Sync`, since `alloc`/`free` themselves assume single-threaded access.
unsafe impl Send for PrivateArena {}

impl PrivateArena {
    pub fn new(reclaim_queue_capacity: usize) -> Self {
        Self {
            reclaim_queue: SpscRing::new(reclaim_queue_capacity),
        }
    }

    /// Called by a peer context that holds a pointer allocated by this arena but does
    /// not own it: hands the pointer back across the SPSC reclaim queue instead of
    /// freeing it directly (which would require a lock this arena doesn't have).
    /// Non-blocking; drops the request with a warning if the queue is momentarily
    /// full (the owner will still see it on its next `drain_reclaimed` if a retry
    /// succeeds upstream).
    pub fn return_to_owner(&self, ptr: NonNull<u8>, layout: Layout) -> Result<(), (NonNull<u8>, Layout)> {
        match self.reclaim_queue.try_push((ptr, layout)) {
            Ok(()) => Ok(()),
            Err(crate::ring::spsc::TryPushError::Full(item)) => Err(item),
        }
    }

    /// Drains pointers handed back by peer contexts and frees them on the owning
    /// thread. Intended to be called once per strand idle iteration, alongside the
    /// async-call inbox and forward-buffer drains.
    pub fn drain_reclaimed(&self) -> usize {
        let mut freed = 0;
        while let Ok((ptr, layout)) = self.reclaim_queue.try_pop() {
            // SAFETY: every entry in `reclaim_queue` was placed there by
            // `return_to_owner`, whose own safety contract requires the pointer to
            // have come from this same arena.
            unsafe { self.free(ptr, layout) };
            freed += 1;
        }
        freed
    }
}

// SAFETY: System's alloc/dealloc/realloc already satisfy `GlobalAlloc`'s contract for
// the layouts this arena is asked to handle; we forward to it 1:1.
unsafe impl Arena for PrivateArena {
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        // SAFETY: `layout` has non-zero size per `Layout`'s own invariant, matching
        // `GlobalAlloc::alloc`'s precondition.
        NonNull::new(unsafe { System.alloc(layout) })
    }

    fn calloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        // SAFETY: same precondition as `alloc`.
        NonNull::new(unsafe { System.alloc_zeroed(layout) })
    }

    unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: forwarded from the caller's contract on `Self::realloc`.
        NonNull::new(unsafe { System.realloc(ptr.as_ptr(), old_layout, new_size) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded from the caller's contract on `Self::free`.
        unsafe { System.dealloc(ptr.as_ptr(), layout) };
    }
}

/// Process-wide arena guarded by a thread spinlock (a busy-wait `Mutex`-equivalent;
/// represented with a real `Mutex` here since `std::sync::Mutex` on Linux already
/// degenerates to a short adaptive spin before parking, matching the spec's "coarse
/// spinlock" characterization closely enough without hand-rolling `AtomicBool`
/// spinning for the common case).
#[derive(Default)]
pub struct CommonArena {
    lock: Mutex<()>,
    contended: AtomicBool,
}

impl CommonArena {
    pub fn new() -> Self { Self::default() }

    /// Whether the last operation had to wait for the lock. Exposed for diagnostics,
    /// not load-bearing for correctness.
    pub fn was_contended(&self) -> bool { self.contended.load(Ordering::Relaxed) }

    fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let guard = match self.lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.contended.store(true, Ordering::Relaxed);
                self.lock.lock().expect("common arena mutex poisoned")
            }
        };
        let result = f();
        drop(guard);
        result
    }
}

// SAFETY: every operation takes `self.lock` before touching the underlying
// allocator, so concurrent access from multiple contexts is sound.
unsafe impl Arena for CommonArena {
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        self.with_lock(|| NonNull::new(unsafe { System.alloc(layout) }))
    }

    fn calloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        self.with_lock(|| NonNull::new(unsafe { System.alloc_zeroed(layout) }))
    }

    unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        self.with_lock(|| NonNull::new(unsafe { System.realloc(ptr.as_ptr(), old_layout, new_size) }))
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        self.with_lock(|| unsafe { System.dealloc(ptr.as_ptr(), layout) });
    }

    unsafe fn bulk_free(&self, items: &[(NonNull<u8>, Layout)]) {
        self.with_lock(|| {
            for &(ptr, layout) in items {
                // SAFETY: forwarded from the caller's per-item contract; the lock is
                // already held for the whole batch.
                unsafe { System.dealloc(ptr.as_ptr(), layout) };
            }
        });
    }
}
