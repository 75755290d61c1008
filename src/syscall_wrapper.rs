// SPDX-License-Identifier: Apache-2.0

//! Turns a blocking system call into something a fiber can await without stalling the
//! OS thread it runs on (§4.8). See [`HelperThread`] and [`blocking_call`].
//!
//! A fiber calling [`blocking_call`] hands the actual syscall (as a boxed closure) to
//! a [`HelperThread`], blocks, and is woken either when the helper finishes and posts
//! the result back through the owning context's async-call inbox, or when another
//! fiber on the same strand cancels it first. Both wake paths converge on the same
//! `block_now()` return point; [`AsyncNode::status`] arbitrates between them so a
//! helper thread that finishes after cancellation never resumes a fiber id that may
//! since have been reused by an unrelated fiber.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::async_call::{AsyncCall, AsyncInbox, MAX_ASYNC_ARGS};
use crate::error::WorkerSpawnError;
use crate::fiber::fiber::FiberId;
use crate::fiber::strand::with_current_strand;
use crate::ring::mpmc::MpmcRing;

const STATUS_PENDING: u8 = 0;
const STATUS_DONE: u8 = 1;
const STATUS_CANCELED: u8 = 2;

/// The stack-resident-in-spirit record the spec describes: status, the waiting
/// fiber's id, and the syscall's outcome slots. Heap-allocated and reference-counted
/// here (rather than genuinely stack-resident) since it must outlive the posting
/// fiber's stack frame across a thread hop to the helper and back.
struct AsyncNode {
    fiber: FiberId,
    status: AtomicU8,
    result: AtomicI64,
    errno: AtomicI32,
}

impl AsyncNode {
    fn new(fiber: FiberId) -> Self {
        Self {
            fiber,
            status: AtomicU8::new(STATUS_PENDING),
            result: AtomicI64::new(-1),
            errno: AtomicI32::new(0),
        }
    }
}

type Syscall = Box<dyn FnOnce() -> io::Result<i64> + Send>;

struct SyscallTask {
    node: Arc<AsyncNode>,
    syscall: Syscall,
    resume_inbox: Arc<AsyncInbox>,
}

/// A dedicated OS thread that performs blocking syscalls on behalf of fibers. Not a
/// [`Context`] itself - it never drives a strand, only pops queued syscalls, runs
/// them, and posts completions back into whichever context's inbox is waiting.
pub struct HelperThread {
    queue: Arc<MpmcRing<SyscallTask>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HelperThread {
    pub fn spawn(name: &str, queue_capacity: usize) -> Result<Self, WorkerSpawnError> {
        let queue = Arc::new(MpmcRing::new(queue_capacity));
        let stop = Arc::new(AtomicBool::new(false));
        let worker_queue = Arc::clone(&queue);
        let worker_stop = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run_helper_loop(worker_queue, worker_stop))
            .map_err(WorkerSpawnError::Spawn)?;

        Ok(Self { queue, stop, handle: Some(handle) })
    }

    fn submit(&self, task: SyscallTask) { self.queue.push(task); }

    /// Asks the helper loop to exit once its queue drains, then joins it. Any
    /// syscalls still queued at shutdown run to completion first; the loop does not
    /// discard pending work.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HelperThread {
    fn drop(&mut self) { self.shutdown(); }
}

fn run_helper_loop(queue: Arc<MpmcRing<SyscallTask>>, stop: Arc<AtomicBool>) {
    let mut backoff = crate::common::Backoff::new();
    loop {
        match queue.try_pop() {
            Ok(task) => {
                backoff.reset();
                run_one(task);
            }
            Err(_) if stop.load(Ordering::Acquire) && queue.is_empty() => break,
            Err(_) => {
                if backoff.snooze() {
                    std::thread::yield_now();
                }
            }
        }
    }
}

fn run_one(task: SyscallTask) {
    let outcome = (task.syscall)();
    let (result, errno) = match outcome {
        Ok(value) => (value, 0),
        Err(error) => (-1, error.raw_os_error().unwrap_or(libc::EIO)),
    };
    task.node.result.store(result, Ordering::Relaxed);
    task.node.errno.store(errno, Ordering::Relaxed);

    // Only resume the fiber if it hasn't already been unblocked by cancellation -
    // `status` is the single point both wake paths arbitrate through, so a helper
    // that finishes late never wakes a fiber id some unrelated fiber may have reused.
    if task
        .node
        .status
        .compare_exchange(STATUS_PENDING, STATUS_DONE, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        let node_ptr = Arc::into_raw(task.node) as usize;
        task.resume_inbox.post(AsyncCall::new(resume_fiber, [node_ptr, 0, 0, 0]));
    }
}

/// Posted into the owning context's inbox by the helper thread; runs only while that
/// inbox is drained from inside the owning strand's `run_loop`, where the §9
/// thread-local backstop is guaranteed valid.
fn resume_fiber(args: &[usize; MAX_ASYNC_ARGS]) {
    // SAFETY: `node_ptr` was produced by `Arc::into_raw` in `run_one` and is consumed
    // exactly once, here.
    let node = unsafe { Arc::from_raw(args[0] as *const AsyncNode) };
    with_current_strand(|strand| strand.run(node.fiber));
}

/// Runs `syscall` on `helper`, blocking the current fiber until it completes or is
/// canceled. Returns the syscall's result on success, or an [`io::Error`] built from
/// its reported errno - matching the spec's "return the result, setting errno on
/// failure" contract via Rust's `Result` instead of a thread-local errno.
///
/// Takes `my_inbox` (the calling fiber's own context's async inbox, for the helper to
/// post its completion back into) rather than a `&mut Context`: a fiber body only
/// ever runs through a boxed `'static` closure with no direct borrow of the `Context`
/// that owns it, so the strand operations this needs (current fiber id, `block_now`,
/// the cancellation peek) go through [`with_current_strand`] - the one thread-local
/// backstop the design notes carve out for exactly this kind of wrapper - while
/// `my_inbox` is an ordinary `Arc` clone the collaborator layer is expected to capture
/// into the fiber closure alongside whatever else it needs.
///
/// # Panics
///
/// Panics if called outside a fiber (mirrors every other context/strand entry point).
pub fn blocking_call(
    my_inbox: &Arc<AsyncInbox>,
    helper: &HelperThread,
    syscall: impl FnOnce() -> io::Result<i64> + Send + 'static,
) -> io::Result<i64> {
    let fiber = with_current_strand(|strand| strand.current())
        .flatten()
        .expect("blocking_call called outside a fiber");
    let node = Arc::new(AsyncNode::new(fiber));

    helper.submit(SyscallTask {
        node: Arc::clone(&node),
        syscall: Box::new(syscall),
        resume_inbox: Arc::clone(my_inbox),
    });

    with_current_strand(|strand| strand.block_now());

    // Either the helper's completion or a peer fiber's cancellation woke us. If it
    // was cancellation, claim the node before exiting via `testcancel` so a
    // completion that arrives afterward sees `STATUS_CANCELED` and skips resuming a
    // since-reused fiber id.
    let canceled = with_current_strand(|strand| strand.fiber_cancel_mut(fiber).should_cancel_now())
        .unwrap_or(false);
    if canceled {
        let _ = node.status.compare_exchange(
            STATUS_PENDING,
            STATUS_CANCELED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        with_current_strand(|strand| strand.testcancel());
        unreachable!("testcancel exits a fiber whose cancellation is due");
    }

    debug_assert_eq!(node.status.load(Ordering::Acquire), STATUS_DONE);
    let result = node.result.load(Ordering::Relaxed);
    let errno = node.errno.load(Ordering::Relaxed);
    if result < 0 {
        Err(io::Error::from_raw_os_error(errno))
    } else {
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::strand::Strand;
    use std::sync::atomic::Ordering as O;
    use std::sync::Mutex;

    /// Drives `strand` until every fiber it starts with has finished, draining
    /// `inbox` on every idle tick so a helper thread's completion call gets a chance
    /// to run - the minimal stand-in for `Context::drive`'s idle cycle that this
    /// module's tests need, without pulling in the listener/timer machinery.
    fn drive_until_idle_for(strand: &mut Strand, inbox: &AsyncInbox, max_idle_ticks: u32) {
        let mut idle_ticks = 0;
        strand.run_loop(|strand| {
            inbox.drain();
            idle_ticks += 1;
            if idle_ticks > max_idle_ticks {
                strand.request_stop();
            }
        });
    }

    #[test]
    fn blocking_call_returns_the_syscall_result() {
        let mut strand = Strand::new(1);
        let inbox = Arc::new(AsyncInbox::new(16));
        let mut helper = HelperThread::spawn("test-helper", 16).unwrap();

        let outcome = Arc::new(Mutex::new(None));
        let outcome_in_fiber = Arc::clone(&outcome);
        let inbox_in_fiber = Arc::clone(&inbox);
        let helper_ref: *const HelperThread = &helper;
        strand.create(16, move || {
            // SAFETY: `helper` outlives this fiber - the fiber runs to completion
            // inside `drive_until_idle_for` below, before `helper` is dropped.
            let helper = unsafe { &*helper_ref };
            let result = blocking_call(&inbox_in_fiber, helper, || Ok(42));
            *outcome_in_fiber.lock().unwrap() = Some(result);
        });

        drive_until_idle_for(&mut strand, &inbox, 500);

        let result = outcome.lock().unwrap().take().expect("fiber did not complete");
        assert_eq!(result.unwrap(), 42);

        helper.shutdown();
    }

    #[test]
    fn blocking_call_surfaces_the_syscall_error() {
        let mut strand = Strand::new(1);
        let inbox = Arc::new(AsyncInbox::new(16));
        let mut helper = HelperThread::spawn("test-helper-err", 16).unwrap();

        let outcome = Arc::new(Mutex::new(None));
        let outcome_in_fiber = Arc::clone(&outcome);
        let inbox_in_fiber = Arc::clone(&inbox);
        let helper_ref: *const HelperThread = &helper;
        strand.create(16, move || {
            let helper = unsafe { &*helper_ref };
            let result = blocking_call(&inbox_in_fiber, helper, || {
                Err(io::Error::from_raw_os_error(libc::ENOENT))
            });
            *outcome_in_fiber.lock().unwrap() = Some(result);
        });

        drive_until_idle_for(&mut strand, &inbox, 500);

        let result = outcome.lock().unwrap().take().expect("fiber did not complete");
        let error = result.unwrap_err();
        assert_eq!(error.raw_os_error(), Some(libc::ENOENT));

        helper.shutdown();
    }

    #[test]
    fn helper_thread_runs_a_queued_syscall_to_completion() {
        let mut helper = HelperThread::spawn("syscall-test", 16).unwrap();
        let node = Arc::new(AsyncNode::new(FiberId(0)));
        let inbox = Arc::new(AsyncInbox::new(16));

        helper.submit(SyscallTask {
            node: Arc::clone(&node),
            syscall: Box::new(|| Ok(42)),
            resume_inbox: Arc::clone(&inbox),
        });

        let mut waited = 0;
        while node.status.load(O::SeqCst) == STATUS_PENDING && waited < 1000 {
            std::thread::sleep(std::time::Duration::from_millis(1));
            waited += 1;
        }

        assert_eq!(node.status.load(O::SeqCst), STATUS_DONE);
        assert_eq!(node.result.load(O::SeqCst), 42);
        helper.shutdown();
    }

    #[test]
    fn cancellation_claims_the_node_before_a_late_completion() {
        let node = Arc::new(AsyncNode::new(FiberId(3)));
        assert_eq!(
            node.status.compare_exchange(
                STATUS_PENDING,
                STATUS_CANCELED,
                O::AcqRel,
                O::Acquire
            ),
            Ok(STATUS_PENDING)
        );
        // A late helper completion's CAS from PENDING now fails, so it never resumes.
        assert!(node
            .status
            .compare_exchange(STATUS_PENDING, STATUS_DONE, O::AcqRel, O::Acquire)
            .is_err());
    }
}
