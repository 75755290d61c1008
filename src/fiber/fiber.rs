// SPDX-License-Identifier: Apache-2.0

//! A single stackful fiber. See [`Fiber`] and [`FiberId`].

use crate::fiber::cancel::CancelState;
use crate::stack::{GuardedStack, StackContext};

/// Index into a [`Strand`](super::strand::Strand)'s fiber slab. Stable across the
/// fiber's lifetime, including through reuse from the dead-list pool (a recycled slot
/// keeps its `FiberId`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    Pending,
    Running,
    Blocked,
    Invalid,
}

/// A cleanup handler registered by [`super::strand::Strand::push_cleanup`], run in LIFO
/// order on fiber exit (including cancellation).
pub type CleanupHandler = Box<dyn FnOnce() + Send>;

pub struct Fiber {
    pub state: FiberState,
    pub cancel: CancelState,
    pub priority: u8,
    pub original_priority: u8,
    pub waiting: bool,
    pub broken: bool,
    pub(crate) stack: GuardedStack,
    pub(crate) context: StackContext,
    cleanup_stack: Vec<CleanupHandler>,
}

impl Fiber {
    pub(crate) fn new(stack: GuardedStack, context: StackContext, priority: u8) -> Self {
        Self {
            state: FiberState::Pending,
            cancel: CancelState::new(),
            priority,
            original_priority: priority,
            waiting: false,
            broken: false,
            stack,
            context,
            cleanup_stack: Vec::new(),
        }
    }

    /// Resets a dead fiber so the slab slot can be reused for a new fiber of the same
    /// stack size, without remapping the stack.
    pub(crate) fn recycle_for(&mut self, context: StackContext, priority: u8) {
        self.state = FiberState::Pending;
        self.cancel = CancelState::new();
        self.priority = priority;
        self.original_priority = priority;
        self.waiting = false;
        self.broken = false;
        self.context = context;
        self.cleanup_stack.clear();
    }

    pub fn push_cleanup(&mut self, handler: CleanupHandler) { self.cleanup_stack.push(handler); }

    /// Runs every registered cleanup handler in LIFO order, draining the stack.
    pub(crate) fn run_cleanup_handlers(&mut self) {
        while let Some(handler) = self.cleanup_stack.pop() {
            handler();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::context;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    extern "C" fn noop_entry(_arg: usize) -> ! {
        loop {
            std::hint::spin_loop();
        }
    }

    fn make_fiber() -> Fiber {
        let mut stack = GuardedStack::new(1).unwrap();
        // SAFETY: `stack` is freshly allocated and exclusively owned here; it is
        // never switched into in this test.
        let ctx = unsafe { context::prepare(stack.usable(), noop_entry, 0) };
        Fiber::new(stack, ctx, 16)
    }

    #[test]
    fn cleanup_handlers_run_in_lifo_order() {
        let mut fiber = make_fiber();
        let order = Arc::new(AtomicU32::new(0));
        let first = Arc::clone(&order);
        let second = Arc::clone(&order);
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log_a = Arc::clone(&log);
        let log_b = Arc::clone(&log);

        fiber.push_cleanup(Box::new(move || {
            first.fetch_add(1, Ordering::SeqCst);
            log_a.lock().unwrap().push("first-registered");
        }));
        fiber.push_cleanup(Box::new(move || {
            second.fetch_add(1, Ordering::SeqCst);
            log_b.lock().unwrap().push("second-registered");
        }));

        fiber.run_cleanup_handlers();

        assert_eq!(order.load(Ordering::SeqCst), 2);
        assert_eq!(*log.lock().unwrap(), vec!["second-registered", "first-registered"]);
    }

    #[test]
    fn recycle_resets_state() {
        let mut fiber = make_fiber();
        fiber.state = FiberState::Invalid;
        fiber.cancel.request();

        // SAFETY: reprimes the same stack this fiber already owns, for reuse.
        let new_ctx = unsafe { context::prepare(fiber.stack.usable(), noop_entry, 0) };
        fiber.recycle_for(new_ctx, 5);

        assert_eq!(fiber.state, FiberState::Pending);
        assert_eq!(fiber.priority, 5);
        assert!(!fiber.cancel.should_cancel_now());
    }
}
