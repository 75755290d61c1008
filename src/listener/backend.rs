// SPDX-License-Identifier: Apache-2.0

//! The abstract poll backend (§6) and its `mio`-backed implementation. See
//! [`PollBackend`] and [`MioBackend`].
//!
//! `mio::Poll` plus `mio::Waker` already implement exactly the cross-platform
//! epoll/kqueue-with-notify-channel abstraction this module needs: a native
//! user-event-style waker where the OS supports one, a self-pipe-equivalent
//! fallback where it doesn't. This wraps that instead of hand-rolling raw
//! `epoll_ctl`/`kevent` FFI.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Token};

use crate::error::PollBackendError;

/// What a listener wants to change about a sink's registration.
#[derive(Debug, Clone, Copy)]
pub enum ChangeOp {
    Register { readable: bool, writable: bool },
    Reregister { readable: bool, writable: bool },
    Deregister,
}

/// A single staged registration change, keyed by a sink's identifying token.
#[derive(Debug, Clone, Copy)]
pub struct Change {
    pub token: u64,
    pub op: ChangeOp,
}

/// A single readiness notification returned from [`PollBackend::poll`].
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
    pub read_error: bool,
    pub write_error: bool,
    /// Set for the dispatcher's own wake-up token rather than a registered sink.
    pub is_notification: bool,
}

/// The cross-platform polling surface the dispatcher needs: register/unregister
/// interest, wait for readiness with a deadline, and wake a blocked waiter from
/// another thread.
pub trait PollBackend: Send + Sync {
    fn submit_changes(&self, changes: &[Change]) -> Result<(), PollBackendError>;
    fn poll(&self, deadline_us: Option<u64>) -> Result<Vec<PollEvent>, PollBackendError>;
    fn notify(&self) -> Result<(), PollBackendError>;
    fn native_notify_supported(&self) -> bool;
}

const NOTIFY_TOKEN: Token = Token(usize::MAX);

/// A source registered purely by raw file descriptor, for sinks the collaborator
/// layer hands us as bare fds (sockets, pipes) rather than as `mio`-native types.
struct RawFdSource(std::os::unix::io::RawFd);

impl Source for RawFdSource {
    fn register(
        &mut self,
        registry: &mio::Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        mio::unix::SourceFd(&self.0).register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &mio::Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        mio::unix::SourceFd(&self.0).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        mio::unix::SourceFd(&self.0).deregister(registry)
    }
}

/// Poll backend over a single shared `mio::Poll` instance. `poll()` takes the lock
/// for the duration of one OS wait (typically held by whichever strand's bootstrap
/// fiber is currently idle); registration changes and `notify()` only need the
/// cloned `Registry`, which is independently `Sync` and usable while a `poll()` call
/// is in flight on another thread.
pub struct MioBackend {
    poll: Mutex<mio::Poll>,
    registry: mio::Registry,
    waker: mio::Waker,
    wake_generation: AtomicU64,
}

impl MioBackend {
    pub fn new() -> Result<Self, PollBackendError> {
        let poll = mio::Poll::new().map_err(PollBackendError::Create)?;
        let registry = poll
            .registry()
            .try_clone()
            .map_err(PollBackendError::Create)?;
        let waker =
            mio::Waker::new(&registry, NOTIFY_TOKEN).map_err(PollBackendError::NotifyChannel)?;
        Ok(Self {
            poll: Mutex::new(poll),
            registry,
            waker,
            wake_generation: AtomicU64::new(0),
        })
    }

    fn interest_for(readable: bool, writable: bool) -> Option<Interest> {
        match (readable, writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl PollBackend for MioBackend {
    fn submit_changes(&self, changes: &[Change]) -> Result<(), PollBackendError> {
        for change in changes {
            let token = Token(change.token as usize);
            let result = match change.op {
                ChangeOp::Register { readable, writable } => {
                    let Some(interest) = Self::interest_for(readable, writable) else {
                        continue;
                    };
                    let mut source = RawFdSource(change.token as std::os::unix::io::RawFd);
                    self.registry.register(&mut source, token, interest)
                }
                ChangeOp::Reregister { readable, writable } => {
                    let Some(interest) = Self::interest_for(readable, writable) else {
                        continue;
                    };
                    let mut source = RawFdSource(change.token as std::os::unix::io::RawFd);
                    self.registry.reregister(&mut source, token, interest)
                }
                ChangeOp::Deregister => {
                    let mut source = RawFdSource(change.token as std::os::unix::io::RawFd);
                    self.registry.deregister(&mut source)
                }
            };
            result.map_err(PollBackendError::Register)?;
        }
        Ok(())
    }

    fn poll(&self, deadline_us: Option<u64>) -> Result<Vec<PollEvent>, PollBackendError> {
        let timeout = deadline_us.map(Duration::from_micros);
        let mut events = Events::with_capacity(256);
        let mut poll = self.poll.lock().expect("mio poll mutex poisoned");

        loop {
            match poll.poll(&mut events, timeout) {
                Ok(()) => break,
                // EINTR is absorbed and retried, per the transient-error policy.
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(PollBackendError::Wait(err)),
            }
        }

        let mut out = Vec::with_capacity(events.iter().count());
        for event in events.iter() {
            if event.token() == NOTIFY_TOKEN {
                out.push(PollEvent {
                    token: u64::MAX,
                    readable: false,
                    writable: false,
                    read_error: false,
                    write_error: false,
                    is_notification: true,
                });
                continue;
            }
            out.push(PollEvent {
                token: event.token().0 as u64,
                readable: event.is_readable(),
                writable: event.is_writable(),
                read_error: event.is_read_closed() || event.is_error(),
                write_error: event.is_write_closed() || event.is_error(),
                is_notification: false,
            });
        }
        Ok(out)
    }

    fn notify(&self) -> Result<(), PollBackendError> {
        self.wake_generation.fetch_add(1, Ordering::Relaxed);
        self.waker.wake().map_err(PollBackendError::NotifyChannel)
    }

    fn native_notify_supported(&self) -> bool {
        // `mio::Waker` uses a native eventfd/kqueue-user-event/IOCP mechanism on every
        // platform it supports; the self-pipe fallback only matters on targets mio
        // itself doesn't cover, which this backend doesn't attempt to run on.
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_backend_has_no_ready_events() {
        let backend = MioBackend::new().unwrap();
        let events = backend.poll(Some(0)).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn notify_wakes_a_blocked_poll() {
        let backend = std::sync::Arc::new(MioBackend::new().unwrap());
        let waker_backend = std::sync::Arc::clone(&backend);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            waker_backend.notify().unwrap();
        });

        let events = backend.poll(None).unwrap();
        handle.join().unwrap();
        assert!(events.iter().any(|e| e.is_notification));
    }
}
