// SPDX-License-Identifier: Apache-2.0

//! Self-referential fiber operations (§4.4): the calls a fiber's own entry routine
//! makes on itself mid-flight - `yield_now`, `pause`, `testcancel`, `cancel_state`,
//! `exit`. A fiber's entry closure is a boxed `'static` closure with no borrow of the
//! [`Context`](crate::context::Context) that scheduled it (the same reason
//! [`crate::syscall_wrapper::blocking_call`] goes through a thread-local rather than
//! a parameter), so these go through the same single thread-local backstop §9
//! sanctions for cancellation-aware blocking wrappers, generalized from a bare
//! `*mut Strand` to `*mut Context` since `pause` needs the owning context's timer
//! queue and clock, not just its scheduler.

use std::cell::Cell;
use std::time::Duration;

use crate::context::Context;
use crate::fiber::cancel::FiberExit;

thread_local! {
    static CURRENT_CONTEXT: Cell<*mut Context> = const { Cell::new(std::ptr::null_mut()) };
}

/// Installed by [`Context::drive`] for the duration of its run loop. Not exposed
/// outside the crate; every public function below goes through it.
pub(crate) struct CurrentContextGuard;

impl CurrentContextGuard {
    pub(crate) fn install(context: &mut Context) -> Self {
        let ptr: *mut Context = context;
        CURRENT_CONTEXT.with(|cell| cell.set(ptr));
        CurrentContextGuard
    }
}

impl Drop for CurrentContextGuard {
    fn drop(&mut self) {
        CURRENT_CONTEXT.with(|cell| cell.set(std::ptr::null_mut()));
    }
}

fn current_context_ptr() -> *mut Context {
    let ptr = CURRENT_CONTEXT.with(Cell::get);
    assert!(!ptr.is_null(), "fiber self-operation called outside a running fiber");
    ptr
}

/// Puts the running fiber back onto its strand's runqueue at its own priority and
/// switches to the next ready fiber. Not a cancellation point.
pub fn yield_now() {
    let ptr = current_context_ptr();
    // SAFETY: `ptr` was installed by `Context::drive` for this OS thread and is
    // valid for the duration of the run loop; this call only runs from inside a
    // fiber the same loop is currently switched into.
    unsafe { &mut *ptr }.strand.yield_now();
}

/// A cancellation point: exits the running fiber with the canceled sentinel if its
/// cancellation is due and not disabled.
pub fn testcancel() {
    let ptr = current_context_ptr();
    // SAFETY: see `yield_now`.
    unsafe { &mut *ptr }.testcancel();
}

/// Arms a timer for `timeout`, blocks the running fiber, and disarms the timer on
/// wake whether it fired or something else (a wait-set signal, cancellation) made
/// the fiber ready first. A cancellation point.
pub fn pause(timeout: Duration) {
    let ptr = current_context_ptr();
    // SAFETY: see `yield_now`.
    unsafe { &mut *ptr }.pause(timeout);
}

/// Toggles the running fiber's cancel-disabled flag; cancellation points reached
/// while disabled do not take effect until it is re-enabled.
pub fn cancel_state(enabled: bool) {
    let ptr = current_context_ptr();
    // SAFETY: see `yield_now`.
    let context = unsafe { &mut *ptr };
    let id = context.strand.current().expect("cancel_state called outside a fiber");
    context.strand.fiber_cancel_mut(id).set_disabled(!enabled);
}

/// Runs the running fiber's cleanup handlers in LIFO order and retires it. Never
/// returns; equivalent to letting the fiber's entry closure return normally, provided
/// for call sites that want to exit early from nested code.
pub fn exit() -> ! {
    let ptr = current_context_ptr();
    // SAFETY: see `yield_now`.
    unsafe { &mut *ptr }.exit_current(FiberExit::Completed(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::listener::backend::MioBackend;
    use crate::listener::dispatch::Dispatch;
    use crate::listener::sink::ContextId;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn make_context() -> Context {
        let (context, _dispatch) = make_context_with_dispatch();
        context
    }

    fn make_context_with_dispatch() -> (Context, Arc<Dispatch>) {
        let backend: Arc<dyn crate::listener::backend::PollBackend> =
            Arc::new(MioBackend::new().unwrap());
        let dispatch = Arc::new(Dispatch::new(backend, 1, 64));
        let context = Context::new(ContextId(0), Arc::clone(&dispatch), 1, 64, 16);
        (context, dispatch)
    }

    /// Ten fibers, each calling the self-referential [`yield_now`] between
    /// increments of a shared counter - the real cooperative suspension §8 scenario
    /// 4 describes, unlike `Strand`'s own unit test of the same shape which drives
    /// the scheduler directly without a fiber calling back into it.
    #[test]
    fn yield_now_called_from_inside_a_running_fiber_yields_and_resumes() {
        let mut context = make_context();
        let total = Arc::new(AtomicU64::new(0));
        let finished = Arc::new(AtomicU64::new(0));

        for _ in 0..10 {
            let total = Arc::clone(&total);
            let finished = Arc::clone(&finished);
            context.create_fiber(16, move || {
                for _ in 0..10_000 {
                    total.fetch_add(1, Ordering::SeqCst);
                    yield_now();
                }
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }

        let _guard = CurrentContextGuard::install(&mut context);
        let mut idle_ticks = 0;
        context.strand.run_loop(|strand| {
            idle_ticks += 1;
            if idle_ticks > 10 {
                strand.request_stop();
            }
        });
        drop(_guard);

        assert_eq!(finished.load(Ordering::SeqCst), 10);
        assert_eq!(total.load(Ordering::SeqCst), 100_000);
    }

    #[test]
    fn pause_called_from_inside_a_running_fiber_blocks_for_the_timeout() {
        let (mut context, dispatch) = make_context_with_dispatch();
        let woke = Arc::new(AtomicU64::new(0));
        let woke_in_fiber = Arc::clone(&woke);

        context.create_fiber(16, move || {
            pause(std::time::Duration::from_millis(20));
            woke_in_fiber.store(1, Ordering::SeqCst);
        });

        let stop = context.stop_handle();
        let started = std::time::Instant::now();
        let handle = std::thread::spawn(move || context.drive());

        let deadline = started + std::time::Duration::from_secs(5);
        while woke.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(woke.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= std::time::Duration::from_millis(15));

        // `drive()`'s poll blocks with no timeout once the pause timer has fired and
        // no sink is registered; wake it the same way `Domain::shutdown` does so the
        // next idle tick observes `stop`.
        stop.store(true, Ordering::Release);
        dispatch.backend().notify().unwrap();
        handle.join().unwrap();
    }
}
