// SPDX-License-Identifier: Apache-2.0

//! A user-space concurrent fiber runtime: one cooperative stackful-fiber scheduler
//! per OS thread, a shared epoll/kqueue-backed event dispatcher with cross-thread
//! forwarding, lock-free SPSC/MPMC rings, a single-executor combiner, epoch-based
//! reclamation for event sinks, and fiber wait-sets and timers.
//!
//! [`Domain::build`](domain::Domain::build) is the entry point: it takes a
//! [`DomainConfig`](config::DomainConfig), spawns one worker thread per configured
//! context, and returns a handle for posting async calls and shutting the whole
//! runtime down. Everything below that - fibers, rings, the combiner, the event
//! dispatch - is reached through a [`Context`](context::Context), not used standalone
//! by an embedder.
//!
//! Module layout mirrors the component boundaries of the design this crate
//! implements: `ring`/`combiner`/`epoch` are the shared lock-free primitives;
//! `stack`/`fiber` are the scheduler; `listener` is the event dispatcher; `context`
//! and `domain` tie a thread's scheduler, dispatcher slice, inbox, timers, and
//! allocator into one runnable unit and a fixed pool of them, respectively.

pub mod arena;
pub mod async_call;
pub mod combiner;
pub mod common;
pub mod config;
pub mod context;
pub mod domain;
pub mod epoch;
pub mod error;
pub mod fiber;
pub mod listener;
pub mod log;
pub mod ring;
pub mod stack;
pub mod syscall_wrapper;
pub mod timer;
pub mod waitset;

pub use config::{DomainConfig, RestartPolicy};
pub use context::Context;
pub use domain::Domain;
pub use error::{DomainBuildError, FatalReason, PollBackendError, StackAllocError, WorkerSpawnError};
