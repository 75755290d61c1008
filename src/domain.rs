// SPDX-License-Identifier: Apache-2.0

//! The top-level [`Domain`]: owns the shared poll backend, spawns one worker OS
//! thread per [`Context`], and exposes the cross-thread entry points an embedder
//! calls from outside any fiber - posting async calls and shutting everything down.
//!
//! Grounded on the teacher's `RRT` thread-lifecycle manager: a spawn routine wrapped
//! in [`catch_unwind`] so a worker's startup panic turns into a typed error rather
//! than taking the whole process down, plus a restart policy carried through
//! [`DomainConfig`] for the syscall-wrapper helper threads (§4.8) that actually use
//! it. Unlike `RRT`, a `Domain`'s workers are not relaunched individually - losing a
//! worker thread loses that slice of the fiber graph, so a panicked worker is treated
//! as fatal (`abort_with`) rather than restarted, matching §7 case 1.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::async_call::{AsyncCall, AsyncInbox, MAX_ASYNC_ARGS};
use crate::config::DomainConfig;
use crate::context::Context;
use crate::error::{DomainBuildError, WorkerSpawnError};
use crate::listener::backend::{MioBackend, PollBackend};
use crate::listener::dispatch::Dispatch;
use crate::listener::sink::ContextId;

/// One spawned worker: its inbox (so other contexts and the domain itself can post
/// to it), its join handle, and the flag used to ask its `drive()` loop to stop.
struct Worker {
    inbox: Arc<AsyncInbox>,
    stop_requested: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// The runtime's top-level handle: the shared dispatch plus every worker thread it
/// owns. Built once from a [`DomainConfig`] and torn down once via [`Self::shutdown`].
pub struct Domain {
    dispatch: Arc<Dispatch>,
    workers: Vec<Worker>,
}

impl Domain {
    /// Builds the shared poll backend and dispatch, spawns `config.worker_count`
    /// worker threads (each running its own [`Context::drive`] loop), and returns
    /// once every worker has started. A worker's [`Context`] is constructed on the
    /// spawning thread inside [`catch_unwind`] before the thread itself is handed the
    /// driver loop, so a stack-allocation failure surfaces as a typed
    /// [`DomainBuildError::WorkerAlloc`] rather than aborting the whole domain for a
    /// transient resource limit on one worker.
    pub fn build(config: &DomainConfig) -> Result<Self, DomainBuildError> {
        config
            .validate()
            .map_err(|reason| DomainBuildError::InvalidConfig { reason })?;

        let backend: Arc<dyn PollBackend> =
            Arc::new(MioBackend::new().map_err(DomainBuildError::PollBackend)?);
        let dispatch = Arc::new(Dispatch::new(
            backend,
            config.worker_count,
            config.forward_buffer_capacity,
        ));

        let mut workers = Vec::with_capacity(config.worker_count);
        for index in 0..config.worker_count {
            let context = catch_unwind(AssertUnwindSafe(|| {
                Context::new(
                    ContextId(index),
                    Arc::clone(&dispatch),
                    config.default_stack_pages,
                    config.async_inbox_capacity,
                    config.async_inbox_capacity,
                )
            }))
            .map_err(|_| DomainBuildError::WorkerAlloc {
                index,
                source: crate::error::StackAllocError::GuardPage(std::io::Error::other(
                    "worker context construction panicked",
                )),
            })?;

            let inbox = Arc::clone(&context.inbox);
            let stop_requested = context.stop_handle();
            let core_id = config
                .core_ids
                .as_ref()
                .and_then(|ids| ids.get(index).copied());

            let handle = spawn_worker(index, core_id, context)
                .map_err(|source| DomainBuildError::WorkerSpawn { index, source })?;

            workers.push(Worker {
                inbox,
                stop_requested,
                handle: Some(handle),
            });
        }

        Ok(Self { dispatch, workers })
    }

    pub fn dispatch(&self) -> &Arc<Dispatch> { &self.dispatch }

    pub fn worker_count(&self) -> usize { self.workers.len() }

    /// Posts `call` to worker `target`'s inbox, blocking (spin-then-yield, never the
    /// fiber scheduler) if the inbox is momentarily full. Intended for callers
    /// outside any fiber context - a fiber posting to its own peers should hold an
    /// `Arc<AsyncInbox>` directly and use [`AsyncInbox::try_post`] instead so a full
    /// inbox yields the fiber rather than blocking the OS thread.
    pub fn post(&self, target: usize, call: AsyncCall) {
        self.workers[target].inbox.post(call);
    }

    pub fn try_post(&self, target: usize, call: AsyncCall) -> Result<(), AsyncCall> {
        self.workers[target].inbox.try_post(call)
    }

    /// Requests every worker's `drive()` loop to stop at its next idle tick, wakes
    /// each one's blocked poll so the request is observed promptly, then joins every
    /// worker thread. Idempotent: calling this twice is a no-op on the second call
    /// since every handle is taken on the first.
    pub fn shutdown(&mut self) {
        for worker in &self.workers {
            worker.stop_requested.store(true, Ordering::Release);
        }
        if let Err(error) = self.dispatch.backend().notify() {
            tracing::warn!(?error, "failed to wake workers for shutdown");
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                if let Err(panic) = handle.join() {
                    tracing::error!(?panic, "worker thread panicked");
                }
            }
        }
    }
}

impl Drop for Domain {
    fn drop(&mut self) { self.shutdown(); }
}

fn spawn_worker(
    index: usize,
    core_id: Option<usize>,
    mut context: Context,
) -> Result<JoinHandle<()>, WorkerSpawnError> {
    std::thread::Builder::new()
        .name(format!("mainmemory-worker-{index}"))
        .spawn(move || {
            if let Some(core_id) = core_id {
                if let Err(error) = pin_to_core(core_id) {
                    tracing::warn!(core_id, %error, "failed to pin worker to core, continuing unpinned");
                }
            }
            let result = catch_unwind(AssertUnwindSafe(|| context.drive()));
            if result.is_err() {
                crate::error::abort_with(crate::error::FatalReason::StackExhausted);
            }
        })
        .map_err(WorkerSpawnError::Spawn)
}

#[cfg(target_os = "linux")]
fn pin_to_core(core_id: usize) -> Result<(), WorkerSpawnError> {
    unsafe {
        let mut cpu_set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut cpu_set);
        libc::CPU_SET(core_id, &mut cpu_set);

        let result = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpu_set);
        if result != 0 {
            return Err(WorkerSpawnError::Affinity {
                core_id,
                errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
            });
        }
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn pin_to_core(core_id: usize) -> Result<(), WorkerSpawnError> {
    // macOS has no direct core-affinity syscall; `THREAD_AFFINITY_POLICY` is an
    // advisory grouping hint for the scheduler, not a binding pin like Linux's
    // `sched_setaffinity`, but it's the closest equivalent available.
    const THREAD_AFFINITY_POLICY: libc::c_int = 4;

    unsafe {
        let thread = pthread_mach_thread_np(libc::pthread_self());
        let affinity_tag: libc::c_int = core_id as libc::c_int;
        let result = thread_policy_set(
            thread,
            THREAD_AFFINITY_POLICY,
            &affinity_tag as *const libc::c_int,
            1,
        );
        if result != 0 {
            return Err(WorkerSpawnError::Affinity { core_id, errno: result });
        }
    }
    Ok(())
}

#[cfg(target_os = "macos")]
extern "C" {
    fn pthread_mach_thread_np(thread: libc::pthread_t) -> libc::mach_port_t;
    fn thread_policy_set(
        thread: libc::mach_port_t,
        flavor: libc::c_int,
        policy_info: *const libc::c_int,
        count: libc::c_uint,
    ) -> libc::c_int;
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn pin_to_core(_core_id: usize) -> Result<(), WorkerSpawnError> { Ok(()) }

/// Packs a single pointer-sized argument into an [`AsyncCall`]'s fixed argument slots,
/// leaving the rest zeroed. A convenience for the common one-argument post.
pub fn call_with_one_arg(routine: fn(&[usize; MAX_ASYNC_ARGS]), arg0: usize) -> AsyncCall {
    let mut args = [0usize; MAX_ASYNC_ARGS];
    args[0] = arg0;
    AsyncCall::new(routine, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn build_and_shutdown_a_single_worker_domain() {
        let config = DomainConfig {
            worker_count: 1,
            core_ids: None,
            ..DomainConfig::default()
        };
        let mut domain = Domain::build(&config).unwrap();
        assert_eq!(domain.worker_count(), 1);
        domain.shutdown();
    }

    #[test]
    fn build_rejects_invalid_config() {
        let mut config = DomainConfig::default();
        config.async_inbox_capacity = 3;
        assert!(Domain::build(&config).is_err());
    }

    static POSTED: AtomicUsize = AtomicUsize::new(0);

    fn record_arg0(args: &[usize; MAX_ASYNC_ARGS]) {
        POSTED.fetch_add(args[0], Ordering::SeqCst);
    }

    #[test]
    fn post_delivers_to_the_named_worker() {
        let config = DomainConfig {
            worker_count: 2,
            core_ids: None,
            ..DomainConfig::default()
        };
        let mut domain = Domain::build(&config).unwrap();

        POSTED.store(0, Ordering::SeqCst);
        domain.try_post(1, call_with_one_arg(record_arg0, 7)).unwrap();

        // The target worker's drive() loop drains its inbox once per idle tick; give
        // it a moment to observe the post before asserting.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(POSTED.load(Ordering::SeqCst), 7);

        domain.shutdown();
    }

    #[test]
    fn build_with_multiple_workers_and_forced_affinity_noop_on_unsupported_platforms() {
        let config = DomainConfig {
            worker_count: 2,
            core_ids: Some(vec![0, 999_999]),
            ..DomainConfig::default()
        };
        // core id 999_999 almost certainly doesn't exist; pinning failure is logged
        // and swallowed rather than failing the build, so this should still succeed.
        let mut domain = Domain::build(&config).unwrap();
        domain.shutdown();
    }
}
