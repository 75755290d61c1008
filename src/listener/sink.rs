// SPDX-License-Identifier: Apache-2.0

//! Event sinks: the dispatcher's per-file-descriptor registration record. See
//! [`EventSink`] and [`SinkFlags`].

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::common::AtomicU32Ext;

/// Which context currently owns a sink's deliveries. Indexes into a
/// [`Domain`](crate::domain::Domain)'s worker list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub usize);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkFlags(u16);

impl SinkFlags {
    pub const INPUT_READY: Self = Self(1 << 0);
    pub const OUTPUT_READY: Self = Self(1 << 1);
    pub const ONESHOT_INPUT: Self = Self(1 << 2);
    pub const ONESHOT_OUTPUT: Self = Self(1 << 3);
    pub const ONESHOT_TRIGGER: Self = Self(1 << 4);
    pub const INPUT_STARTED: Self = Self(1 << 5);
    pub const OUTPUT_STARTED: Self = Self(1 << 6);
    pub const NOTIFY_FD: Self = Self(1 << 7);
    pub const FIXED_POLLER: Self = Self(1 << 8);
    pub const BROKEN: Self = Self(1 << 9);

    pub const NONE: Self = Self(0);

    pub fn contains(self, other: Self) -> bool { self.0 & other.0 == other.0 }

    pub fn insert(&mut self, other: Self) { self.0 |= other.0; }

    pub fn remove(&mut self, other: Self) { self.0 &= !other.0; }
}

impl std::ops::BitOr for SinkFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self { Self(self.0 | rhs.0) }
}

/// A registered file descriptor. `poll_stamp` counts readiness notifications received
/// from the kernel; `task_stamp` counts deliveries to a handler. A sink is "active"
/// (ineligible for ownership reassignment or epoch retirement) whenever those two
/// stamps differ, or either `*_STARTED` flag is set.
pub type SinkTask = Box<dyn Fn() + Send + Sync>;

pub struct EventSink {
    pub fd: RawFd,
    owner: Option<ContextId>,
    flags: SinkFlags,
    poll_stamp: AtomicU32,
    task_stamp: AtomicU32,
    on_input: Option<SinkTask>,
    on_output: Option<SinkTask>,
}

impl EventSink {
    pub fn new(fd: RawFd, owner: ContextId) -> Self {
        Self {
            fd,
            owner: Some(owner),
            flags: SinkFlags::NONE,
            poll_stamp: AtomicU32::new(0),
            task_stamp: AtomicU32::new(0),
            on_input: None,
            on_output: None,
        }
    }

    pub fn set_input_task(&mut self, task: SinkTask) { self.on_input = Some(task); }

    pub fn set_output_task(&mut self, task: SinkTask) { self.on_output = Some(task); }

    /// Runs the input handler, if one is registered, and marks the sink delivered.
    pub fn deliver_input(&self) {
        if let Some(task) = &self.on_input {
            task();
        }
        self.mark_delivered();
    }

    /// Runs the output handler, if one is registered, and marks the sink delivered.
    pub fn deliver_output(&self) {
        if let Some(task) = &self.on_output {
            task();
        }
        self.mark_delivered();
    }

    pub fn owner(&self) -> Option<ContextId> { self.owner }

    pub fn flags(&self) -> SinkFlags { self.flags }

    pub fn set_flag(&mut self, flag: SinkFlags) { self.flags.insert(flag); }

    pub fn clear_flag(&mut self, flag: SinkFlags) { self.flags.remove(flag); }

    /// Marks an event received from the poll backend, advancing `poll_stamp`.
    pub fn mark_polled(&self) { self.poll_stamp.increment(); }

    /// Marks the event as delivered to a handler, advancing `task_stamp` to match
    /// `poll_stamp`.
    pub fn mark_delivered(&self) {
        self.task_stamp.set(self.poll_stamp.get());
    }

    pub fn is_active(&self) -> bool {
        self.poll_stamp.load(Ordering::Acquire) != self.task_stamp.load(Ordering::Acquire)
            || self.flags.contains(SinkFlags::INPUT_STARTED)
            || self.flags.contains(SinkFlags::OUTPUT_STARTED)
    }

    /// Marks the sink as no longer owned by any context (detached). Only valid while
    /// not active.
    pub fn detach(&mut self) { self.owner = None; }

    /// Reassigns ownership to `new_owner`. The caller (the dispatcher's
    /// `test_binding` logic, §4.5) is responsible for only calling this when the sink
    /// is idle and not fixed to a poller.
    pub fn rebind(&mut self, new_owner: ContextId) { self.owner = Some(new_owner); }

    /// Whether this sink may have its ownership reassigned right now: not active, and
    /// not pinned with `FIXED_POLLER`.
    pub fn rebindable(&self) -> bool {
        !self.is_active() && !self.flags.contains(SinkFlags::FIXED_POLLER)
    }
}
