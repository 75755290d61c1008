// SPDX-License-Identifier: Apache-2.0

//! The per-thread [`Context`] aggregate (§3): strand, listener, async-call inbox,
//! timer queue, private allocator arena, and local epoch slot, all exclusive to the
//! single OS thread that owns them.
//!
//! Exactly one `Context` is ever "current" on a given OS thread, matching §3's
//! invariant that a context is never accessed from another thread except through its
//! inbox ring (and, for the listener's forward buffer, the dispatch's shared forward
//! rings). Everything else here - the strand, the timer queue, the retire list inside
//! the listener, the private arena - is touched by no other thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::arena::PrivateArena;
use crate::async_call::AsyncInbox;
use crate::common::SendPtr;
use crate::fiber::cancel::FiberExit;
use crate::fiber::fiber::FiberId;
use crate::error::PollBackendError;
use crate::fiber::strand::Strand;
use crate::listener::dispatch::{Dispatch, Listener};
use crate::listener::sink::ContextId;
use crate::timer::TimerQueue;

/// Monotonic microsecond clock shared by the timer queue and `pause`/timed-wait
/// callers. Backed by [`std::time::Instant`] (always monotonic on every platform Rust
/// supports), anchored once at process start so deadlines fit comfortably in a
/// `u64` without wraparound for the lifetime of any realistic process.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self { Self { epoch: Instant::now() } }

    pub fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros().min(u64::MAX as u128) as u64
    }

    pub fn deadline_us(&self, timeout: Duration) -> u64 {
        self.now_us().saturating_add(timeout.as_micros().min(u64::MAX as u128) as u64)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self { Self::new() }
}

/// One worker thread's full state: the fiber scheduler, its slice of the shared
/// dispatch, its async-call inbox, its timer queue, and its private arena.
pub struct Context {
    pub id: ContextId,
    pub strand: Strand,
    pub listener: Listener,
    pub inbox: Arc<AsyncInbox>,
    pub timers: TimerQueue,
    pub arena: PrivateArena,
    pub clock: MonotonicClock,
    stop_requested: Arc<AtomicBool>,
}

impl Context {
    pub fn new(
        id: ContextId,
        dispatch: Arc<Dispatch>,
        default_stack_pages: usize,
        inbox_capacity: usize,
        arena_reclaim_capacity: usize,
    ) -> Self {
        Self {
            id,
            strand: Strand::new(default_stack_pages),
            listener: Listener::new(id, dispatch),
            inbox: Arc::new(AsyncInbox::new(inbox_capacity)),
            timers: TimerQueue::new(),
            arena: PrivateArena::new(arena_reclaim_capacity),
            clock: MonotonicClock::new(),
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A cross-thread handle that [`Domain::shutdown`](crate::domain::Domain::shutdown)
    /// can flip to ask this context's `drive()` loop to stop at its next idle tick.
    /// Setting the flag alone does not wake a blocked poll; the caller is expected to
    /// also notify the shared backend so the thread actually observes it promptly.
    pub fn stop_handle(&self) -> Arc<AtomicBool> { Arc::clone(&self.stop_requested) }

    /// Arms a timer that runs the current fiber at `deadline_us`, blocks it, and
    /// disarms the timer once it wakes. This is the composition point §4.4 describes
    /// for `pause`: the strand itself knows nothing about timers, only about blocking
    /// and running fiber ids.
    ///
    /// Because fibers are cooperative, the only way execution resumes past
    /// `block_now` below is by this same fiber being switched back into - whether the
    /// timer fired or something else (`cancel`, a wait-set `run`) made it ready
    /// first. Either way `disarm` after the block always runs, so a canceled fiber
    /// can never leave a stale timer armed; a separate cleanup-handler registration
    /// would be redundant here and would leak one no-op entry per `pause` call on a
    /// long-lived fiber that pauses repeatedly.
    pub fn pause(&mut self, timeout: Duration) {
        let id = self.strand.current().expect("pause called outside a fiber");
        let deadline = self.clock.deadline_us(timeout);
        // `TimerQueue::arm` requires `Send` (a `Context` - and the `TimerQueue` inside
        // it - is moved across threads exactly once, at worker-spawn time), but this
        // callback only ever runs on the thread that owns `self.strand`: the timer
        // queue it's armed on is drained from `run_idle_cycle`, which only ever runs
        // on this context's owning thread while the pointee is valid (timers never
        // outlive the `Context` that armed them). `SendPtr` documents that invariant
        // instead of requiring the timer queue itself to give up `Send`.
        let strand_ptr = SendPtr::new(&mut self.strand as *mut Strand);
        let timer_id = self.timers.arm(deadline, move || {
            // SAFETY: see the comment above - this runs on the owning thread only.
            let strand = unsafe { &mut *strand_ptr.get() };
            strand.run(id);
        });
        self.strand.block_now();
        self.timers.disarm(timer_id);
    }

    /// A cancellation point: tests `fiber`'s cancel flag and exits it with the
    /// canceled sentinel if due. Thin wrapper kept here (rather than inlined at every
    /// call site) so every cancellation point in this module goes through the same
    /// path.
    pub fn testcancel(&mut self) { self.strand.testcancel(); }

    /// One idle iteration of the strand's driver loop (§4.4's "bootstrap fiber"
    /// cycle): drains the async inbox, drains forwarded events from peer listeners,
    /// runs one poll cycle with a timeout derived from the nearest timer, ticks the
    /// timer queue, and drains any pointers peer contexts handed back to this
    /// context's private arena.
    pub fn run_idle_cycle(&mut self) -> Result<(), PollBackendError> {
        idle_cycle(&self.inbox, &mut self.listener, &mut self.timers, &self.arena, &self.clock)
    }

    /// Runs the strand's full driver loop on the current OS thread until
    /// `Strand::request_stop` is called (typically from a fiber handling a shutdown
    /// signal). Each idle iteration (no fiber ready) runs the same steps as
    /// [`Self::run_idle_cycle`].
    ///
    /// Destructures `self` into disjoint field borrows before calling
    /// `Strand::run_loop` rather than reaching back into `self` through a raw
    /// pointer from inside the closure: `run_loop` already holds `&mut self.strand`
    /// for the duration of the call, so a second, overlapping `&mut Context`
    /// manufactured from a pointer would alias it.
    pub fn drive(&mut self) {
        // Installs the single thread-local backstop (§9, generalized in
        // `fiber::current` from a bare strand pointer to the whole context) that lets
        // a fiber's own entry routine call `fiber::yield_now`/`pause`/`testcancel`
        // on itself without a borrow of this `Context` - the same reason
        // `syscall_wrapper::resume_fiber` already reaches back through an equivalent
        // pointer from inside `inbox.drain()` below.
        let _current_context = crate::fiber::current::CurrentContextGuard::install(self);
        let Context { strand, listener, inbox, timers, arena, clock, stop_requested, .. } = self;
        strand.run_loop(|strand| {
            if stop_requested.load(Ordering::Acquire) {
                strand.request_stop();
                return;
            }
            if let Err(error) = idle_cycle(inbox, listener, timers, arena, clock) {
                tracing::warn!(?error, "poll cycle failed, continuing");
            }
        });
    }

    pub fn create_fiber(&mut self, priority: u8, entry: impl FnOnce() + Send + 'static) -> FiberId {
        self.strand.create(priority, entry)
    }

    pub fn exit_current(&mut self, result: FiberExit<()>) -> ! { self.strand.exit_current(result) }
}

/// The body of one idle cycle, factored out so both [`Context::run_idle_cycle`] and
/// [`Context::drive`] share it without either one needing `&mut Context` as a whole
/// while a sibling field is already borrowed.
fn idle_cycle(
    inbox: &AsyncInbox,
    listener: &mut Listener,
    timers: &mut TimerQueue,
    arena: &PrivateArena,
    clock: &MonotonicClock,
) -> Result<(), PollBackendError> {
    inbox.drain();
    listener.drain_forwarded();

    let timeout_us = match timers.next_deadline_us() {
        Some(deadline) => Some(deadline.saturating_sub(clock.now_us())),
        None => None,
    };
    listener.run_poll_cycle(timeout_us)?;

    timers.tick(clock.now_us());
    arena.drain_reclaimed();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::backend::MioBackend;

    fn make_context() -> Context {
        let backend: Arc<dyn crate::listener::backend::PollBackend> =
            Arc::new(MioBackend::new().unwrap());
        let dispatch = Arc::new(Dispatch::new(backend, 1, 64));
        Context::new(ContextId(0), dispatch, 1, 64, 16)
    }

    #[test]
    fn monotonic_clock_deadline_is_in_the_future() {
        let clock = MonotonicClock::new();
        let now = clock.now_us();
        let deadline = clock.deadline_us(Duration::from_millis(10));
        assert!(deadline > now);
    }

    #[test]
    fn idle_cycle_runs_without_error_when_nothing_pending() {
        let mut context = make_context();
        context.run_idle_cycle().unwrap();
    }

    #[test]
    fn drive_runs_a_created_fiber_to_completion() {
        let mut context = make_context();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_in_fiber = Arc::clone(&ran);
        context.create_fiber(16, move || {
            ran_in_fiber.store(true, Ordering::SeqCst);
        });

        // A real `drive()` loop only stops via `request_stop` called from inside a
        // fiber handling a shutdown signal; this test exercises the scheduling and
        // idle-cycle plumbing directly instead, bounding the number of idle ticks so
        // the loop terminates once the fiber above has had a chance to run.
        let mut idle_ticks = 0;
        context.strand.run_loop(|strand| {
            idle_ticks += 1;
            if idle_ticks > 5 {
                strand.request_stop();
            }
        });

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn stop_handle_set_before_drive_exits_immediately() {
        let mut context = make_context();
        let stop = context.stop_handle();
        stop.store(true, Ordering::Release);
        context.drive();
    }
}
