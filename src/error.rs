// SPDX-License-Identifier: Apache-2.0

//! Crate-wide error taxonomy. See [`DomainBuildError`], [`PollBackendError`],
//! [`StackAllocError`], and [`WorkerSpawnError`].
//!
//! Only the first two tiers of the error taxonomy (fatal invariant violations and
//! transient system-call errors) get real Rust types here. Fiber-scoped cancellation
//! is expressed through [`crate::fiber::FiberExit`], not through these error types,
//! and resource contention / programming errors never surface across an API boundary
//! at all (they are internal back-off loops or `debug_assert!`s).

use std::io;

/// Failures building a [`Domain`](crate::domain::Domain) at startup. These are fatal:
/// the caller should log and exit rather than retry, since they indicate the process
/// cannot acquire the OS resources the runtime needs to run at all.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum DomainBuildError {
    /// The shared poll backend (the dispatcher's single kqueue/epoll fd) could not be
    /// created.
    #[error("failed to create the shared poll backend")]
    #[diagnostic(code(mainmemory::domain::poll_backend))]
    PollBackend(#[from] PollBackendError),

    /// A worker thread's stack or context could not be allocated.
    #[error("failed to allocate resources for worker {index}")]
    #[diagnostic(code(mainmemory::domain::worker_alloc))]
    WorkerAlloc {
        index: usize,
        #[source]
        source: StackAllocError,
    },

    /// A worker OS thread failed to spawn.
    #[error("failed to spawn worker thread {index}")]
    #[diagnostic(code(mainmemory::domain::worker_spawn))]
    #[cfg_attr(
        target_os = "linux",
        diagnostic(help(
            "Check OS thread limits - `ulimit -u` for per-user processes/threads, \
             `cat /proc/sys/kernel/threads-max` for the system-wide limit"
        ))
    )]
    #[cfg_attr(
        target_os = "macos",
        diagnostic(help(
            "Check OS thread limits - `ulimit -u`, or `sysctl kern.num_taskthreads`"
        ))
    )]
    WorkerSpawn {
        index: usize,
        #[source]
        source: WorkerSpawnError,
    },

    /// `DomainConfig` failed its own internal validation (e.g. a ring capacity that
    /// isn't a power of two).
    #[error("invalid domain configuration: {reason}")]
    #[diagnostic(code(mainmemory::domain::invalid_config))]
    InvalidConfig { reason: &'static str },
}

/// Errors creating or operating the poll backend (§6's abstract `create`/`destroy`/
/// `submit_changes`/`poll`/`notify` surface, backed here by [`mio`]).
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum PollBackendError {
    #[error("failed to create the OS poll instance")]
    #[diagnostic(code(mainmemory::poll::create))]
    Create(#[source] io::Error),

    #[error("failed to create the notify channel")]
    #[diagnostic(code(mainmemory::poll::notify_channel))]
    NotifyChannel(#[source] io::Error),

    #[error("failed to register a change with the poll backend")]
    #[diagnostic(code(mainmemory::poll::register))]
    Register(#[source] io::Error),

    /// The poll syscall itself failed for a reason other than `EINTR` (which is
    /// absorbed silently and retried, per the spec's transient-error policy).
    #[error("poll syscall failed")]
    #[diagnostic(code(mainmemory::poll::wait))]
    Wait(#[source] io::Error),
}

/// Failure to map a guarded fiber stack.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum StackAllocError {
    #[error("mmap failed for a {size_bytes}-byte stack")]
    #[diagnostic(
        code(mainmemory::stack::mmap),
        help("The process may be out of virtual address space or hit RLIMIT_AS.")
    )]
    Mmap {
        size_bytes: usize,
        #[source]
        source: io::Error,
    },

    #[error("mprotect failed to install the guard page")]
    #[diagnostic(code(mainmemory::stack::guard_page))]
    GuardPage(#[source] io::Error),
}

/// Failure to spawn or pin a worker OS thread.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum WorkerSpawnError {
    #[error("std::thread::Builder::spawn failed")]
    #[diagnostic(code(mainmemory::worker::spawn))]
    Spawn(#[source] io::Error),

    #[error("pthread_setaffinity_np failed for core {core_id}")]
    #[diagnostic(
        code(mainmemory::worker::affinity),
        help("The requested core id may not exist on this machine.")
    )]
    Affinity { core_id: usize, errno: i32 },
}

/// A fatal invariant violation (§7 case 1): memory exhaustion at startup, an
/// unrecoverable OS resource failure, or a debug-mode assertion that would otherwise
/// panic unwind through fiber-switch code. Logged, then the process is terminated.
///
/// The core never calls [`std::process::abort`] itself; [`abort_with`] is the single
/// seam an embedder can override with its own flush-then-exit policy (the "CLI
/// collaborator's abort routine" from the external-interfaces module).
#[derive(Debug, Clone, Copy)]
pub enum FatalReason {
    StackExhausted,
    PollBackendLost,
    EpochCounterOverflow,
    CorruptedRingState,
}

impl std::fmt::Display for FatalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            FatalReason::StackExhausted => "fiber stack pool exhausted",
            FatalReason::PollBackendLost => "shared poll backend became unusable",
            FatalReason::EpochCounterOverflow => "global epoch counter overflowed",
            FatalReason::CorruptedRingState => "ring buffer stamp invariant violated",
        };
        f.write_str(text)
    }
}

/// Logs `reason` at `error` level with full context, then terminates the process.
/// Never returns.
pub fn abort_with(reason: FatalReason) -> ! {
    tracing::error!(%reason, "mainmemory: fatal invariant violation, aborting");
    std::process::abort()
}
