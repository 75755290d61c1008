// SPDX-License-Identifier: Apache-2.0

//! Shared dispatch state and the per-context listener. See [`Dispatch`] and
//! [`Listener`].
//!
//! The dispatcher owns one shared poll backend, the global epoch, and the registry of
//! sinks; each context's [`Listener`] is its *slice* of that shared state - a change
//! list, per-target forward buffers, and a retire list, all owned exclusively by the
//! listener's own fiber context and touched by no other thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

use crate::epoch::{EpochDomain, LocalEpoch, RetireList};
use crate::listener::backend::{Change, ChangeOp, PollBackend, PollEvent};
use crate::listener::sink::{ContextId, EventSink, SinkFlags};
use crate::ring::mpmc::{MpmcRing, TryPopError, TryPushError};

/// A batch of sink tokens whose events were observed by one listener but belong to
/// another context, forwarded in a single message rather than one async call per
/// event.
struct ForwardedBatch {
    tokens: Vec<u64>,
}

/// Shared state for an entire [`Domain`](crate::domain::Domain): the poll backend,
/// the global epoch, the sink registry, and one forward ring per context used to
/// batch cross-thread event handoffs.
pub struct Dispatch {
    backend: Arc<dyn PollBackend>,
    epoch: EpochDomain,
    sinks: Mutex<FxHashMap<u64, EventSink>>,
    forward_rings: Vec<MpmcRing<ForwardedBatch>>,
    low_water_mark: usize,
}

impl Dispatch {
    pub fn new(backend: Arc<dyn PollBackend>, context_count: usize, forward_capacity: usize) -> Self {
        Self {
            backend,
            epoch: EpochDomain::new(),
            sinks: Mutex::new(FxHashMap::default()),
            forward_rings: (0..context_count)
                .map(|_| MpmcRing::new(forward_capacity))
                .collect(),
            low_water_mark: 8,
        }
    }

    pub fn backend(&self) -> &Arc<dyn PollBackend> { &self.backend }

    pub fn epoch(&self) -> &EpochDomain { &self.epoch }

    /// Registers a new sink owned by `owner`, returning its token (equal to its fd,
    /// since fds are unique within a process at any given time).
    pub fn register_sink(&self, sink: EventSink) -> u64 {
        let token = sink.fd as u64;
        self.sinks.lock().expect("sink map poisoned").insert(token, sink);
        token
    }
}

/// A context's slice of [`Dispatch`] state: the staged change list, per-target
/// forward buffers, and the retire list for sinks this listener has unregistered but
/// cannot yet free.
pub struct Listener {
    context_id: ContextId,
    dispatch: Arc<Dispatch>,
    local_epoch: Arc<LocalEpoch>,
    change_list: Vec<Change>,
    retire_list: RetireList<u64>,
    direct_events: AtomicU64,
    forwarded_events: AtomicU64,
}

impl Listener {
    pub fn new(context_id: ContextId, dispatch: Arc<Dispatch>) -> Self {
        let local_epoch = dispatch.epoch.register();
        Self {
            context_id,
            dispatch,
            local_epoch,
            change_list: Vec::new(),
            retire_list: RetireList::new(),
            direct_events: AtomicU64::new(0),
            forwarded_events: AtomicU64::new(0),
        }
    }

    pub fn direct_events(&self) -> u64 { self.direct_events.load(Ordering::Relaxed) }

    pub fn forwarded_events(&self) -> u64 { self.forwarded_events.load(Ordering::Relaxed) }

    /// Stages a registration change, flushed as a single syscall by the next
    /// [`Self::run_poll_cycle`].
    pub fn stage_change(&mut self, change: Change) { self.change_list.push(change); }

    pub fn register_and_stage(&mut self, sink: EventSink, readable: bool, writable: bool) -> u64 {
        let token = self.dispatch.register_sink(sink);
        self.stage_change(Change {
            token,
            op: ChangeOp::Register { readable, writable },
        });
        token
    }

    /// Unregisters a sink: stages a deregister change and retires it at the current
    /// global epoch rather than freeing it immediately (§4.6).
    pub fn unregister(&mut self, token: u64) {
        self.stage_change(Change {
            token,
            op: ChangeOp::Deregister,
        });
        let epoch = self.dispatch.epoch.global().current();
        self.retire_list.retire(epoch, token);
    }

    /// Runs one poll cycle: flush staged changes, enter the epoch, poll with
    /// `timeout_us`, advance the global epoch, classify and deliver/forward/enqueue
    /// each event, flush forward buffers, then advance reclamation. Returns the
    /// number of events observed.
    pub fn run_poll_cycle(&mut self, timeout_us: Option<u64>) -> Result<usize, crate::error::PollBackendError> {
        if !self.change_list.is_empty() {
            self.dispatch.backend.submit_changes(&self.change_list)?;
            self.change_list.clear();
        }

        self.local_epoch.enter(self.dispatch.epoch.global());

        let events = self.dispatch.backend.poll(timeout_us)?;

        // §4.4: "After poll returns, it advances the epoch". Poll-cycle boundaries
        // are the advance trigger §4.6 names; without this, every listener keeps
        // observing the same frozen global epoch forever and nothing retired ever
        // clears `min_active_epoch + 2`.
        self.dispatch.epoch.global().advance();

        let mut forward_batches: FxHashMap<usize, Vec<u64>> = FxHashMap::default();

        for event in &events {
            if event.is_notification {
                continue;
            }
            self.handle_event(event, &mut forward_batches);
        }

        for (target, tokens) in forward_batches {
            self.flush_forward_batch(target, tokens);
        }

        self.advance_reclamation();

        Ok(events.len())
    }

    fn handle_event(&mut self, event: &PollEvent, forward_batches: &mut FxHashMap<usize, Vec<u64>>) {
        let mut sinks = self.dispatch.sinks.lock().expect("sink map poisoned");
        let Some(sink) = sinks.get_mut(&event.token) else {
            return;
        };

        // §4.5's `test_binding`: consult idle/fixed-poller state *before* delivering
        // - which here means before `mark_polled` below, since that's what flips a
        // sink from idle to active. Capturing it now and reusing it for whichever
        // branch applies keeps the peer-owned case looking at the same pre-event
        // snapshot the owning-listener and detached cases effectively get for free.
        let can_rebind = sink.rebindable();
        sink.mark_polled();

        match sink.owner() {
            Some(owner) if owner == self.context_id => {
                if event.readable || event.read_error {
                    sink.deliver_input();
                }
                if event.writable || event.write_error {
                    sink.deliver_output();
                }
                self.direct_events.fetch_add(1, Ordering::Relaxed);
            }
            Some(owner) if can_rebind => {
                // Idle, non-fixed sink owned by a peer: rebind to this listener,
                // since it's the one actually seeing this sink's traffic, turning
                // what would be a forward into a direct delivery.
                sink.rebind(self.context_id);
                if event.readable || event.read_error {
                    sink.deliver_input();
                }
                if event.writable || event.write_error {
                    sink.deliver_output();
                }
                self.direct_events.fetch_add(1, Ordering::Relaxed);
            }
            Some(owner) => {
                forward_batches.entry(owner.0).or_default().push(event.token);
                self.forwarded_events.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                // Detached: claim it for this listener since nobody else will.
                sink.rebind(self.context_id);
                if event.readable || event.read_error {
                    sink.deliver_input();
                }
                if event.writable || event.write_error {
                    sink.deliver_output();
                }
                self.direct_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn flush_forward_batch(&self, target: usize, tokens: Vec<u64>) {
        if target >= self.dispatch.forward_rings.len() {
            return;
        }
        let batch = ForwardedBatch { tokens };
        if let Err(TryPushError::Full(_)) = self.dispatch.forward_rings[target].try_push(batch) {
            tracing::warn!(target, "forward ring full, dropping batch");
        }
    }

    /// Drains this listener's own forward ring (events other listeners saw for sinks
    /// this context owns) and delivers them. Called from the strand's idle loop
    /// alongside the async-call inbox drain.
    pub fn drain_forwarded(&mut self) -> usize {
        let my_index = self.context_id.0;
        if my_index >= self.dispatch.forward_rings.len() {
            return 0;
        }
        let ring = &self.dispatch.forward_rings[my_index];
        let mut delivered = 0;
        loop {
            match ring.try_pop() {
                Ok(batch) => {
                    let sinks = self.dispatch.sinks.lock().expect("sink map poisoned");
                    for token in batch.tokens {
                        if let Some(sink) = sinks.get(&token) {
                            sink.deliver_input();
                            delivered += 1;
                        }
                    }
                }
                Err(TryPopError::Empty) => break,
            }
        }
        delivered
    }

    fn advance_reclamation(&mut self) {
        if self.retire_list.len() >= self.dispatch.low_water_mark || !self.retire_list.is_empty() {
            let min_active = self.dispatch.epoch.min_active_epoch();
            let dispatch = Arc::clone(&self.dispatch);
            self.retire_list.advance(min_active, |token| {
                dispatch.sinks.lock().expect("sink map poisoned").remove(&token);
            });
        }
        if self.retire_list.is_empty() {
            self.local_epoch.leave();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::backend::MioBackend;
    use std::sync::atomic::AtomicBool;

    fn make_domain(context_count: usize) -> Arc<Dispatch> {
        let backend: Arc<dyn PollBackend> = Arc::new(MioBackend::new().unwrap());
        Arc::new(Dispatch::new(backend, context_count, 64))
    }

    #[test]
    fn direct_delivery_runs_handler_on_owning_listener() {
        let dispatch = make_domain(1);
        let mut listener = Listener::new(ContextId(0), Arc::clone(&dispatch));

        let delivered = Arc::new(AtomicBool::new(false));
        let delivered_in_task = Arc::clone(&delivered);
        let mut sink = EventSink::new(-1, ContextId(0));
        sink.set_input_task(Box::new(move || {
            delivered_in_task.store(true, Ordering::SeqCst);
        }));
        let token = dispatch.register_sink(sink);

        let mut batches = FxHashMap::default();
        listener.handle_event(
            &PollEvent {
                token,
                readable: true,
                writable: false,
                read_error: false,
                write_error: false,
                is_notification: false,
            },
            &mut batches,
        );

        assert!(delivered.load(Ordering::SeqCst));
        assert_eq!(listener.direct_events(), 1);
        assert_eq!(listener.forwarded_events(), 0);
    }

    #[test]
    fn fixed_poller_peer_owned_sink_is_forwarded_not_delivered() {
        let dispatch = make_domain(2);
        let mut listener_a = Listener::new(ContextId(0), Arc::clone(&dispatch));

        let delivered = Arc::new(AtomicBool::new(false));
        let delivered_in_task = Arc::clone(&delivered);
        let mut sink = EventSink::new(-1, ContextId(1));
        sink.set_flag(SinkFlags::FIXED_POLLER);
        sink.set_input_task(Box::new(move || {
            delivered_in_task.store(true, Ordering::SeqCst);
        }));
        let token = dispatch.register_sink(sink);

        let mut batches = FxHashMap::default();
        listener_a.handle_event(
            &PollEvent {
                token,
                readable: true,
                writable: false,
                read_error: false,
                write_error: false,
                is_notification: false,
            },
            &mut batches,
        );

        assert!(!delivered.load(Ordering::SeqCst));
        assert_eq!(listener_a.direct_events(), 0);
        assert_eq!(listener_a.forwarded_events(), 1);

        for (target, tokens) in batches {
            listener_a.flush_forward_batch(target, tokens);
        }

        let mut listener_b = Listener::new(ContextId(1), Arc::clone(&dispatch));
        let delivered_count = listener_b.drain_forwarded();
        assert_eq!(delivered_count, 1);
        assert!(delivered.load(Ordering::SeqCst));
    }

    #[test]
    fn idle_peer_owned_sink_is_rebound_and_delivered_directly() {
        // §4.5's `test_binding`: an idle, non-fixed sink owned by a peer is
        // reassigned to whichever listener actually observes its traffic, turning
        // what would otherwise be a forward into a direct delivery.
        let dispatch = make_domain(2);
        let mut listener_a = Listener::new(ContextId(0), Arc::clone(&dispatch));

        let delivered = Arc::new(AtomicBool::new(false));
        let delivered_in_task = Arc::clone(&delivered);
        let mut sink = EventSink::new(-1, ContextId(1));
        sink.set_input_task(Box::new(move || {
            delivered_in_task.store(true, Ordering::SeqCst);
        }));
        let token = dispatch.register_sink(sink);

        let mut batches = FxHashMap::default();
        listener_a.handle_event(
            &PollEvent {
                token,
                readable: true,
                writable: false,
                read_error: false,
                write_error: false,
                is_notification: false,
            },
            &mut batches,
        );

        assert!(delivered.load(Ordering::SeqCst));
        assert_eq!(listener_a.direct_events(), 1);
        assert_eq!(listener_a.forwarded_events(), 0);
        assert!(batches.is_empty(), "rebound sink must not also be forwarded");
        assert_eq!(
            dispatch.sinks.lock().unwrap().get(&token).unwrap().owner(),
            Some(ContextId(0)),
            "sink ownership must follow the listener that delivered it"
        );
    }

    #[test]
    fn retired_sink_freed_after_epoch_advances() {
        let dispatch = make_domain(1);
        let mut listener = Listener::new(ContextId(0), Arc::clone(&dispatch));
        let sink = EventSink::new(-1, ContextId(0));
        let token = dispatch.register_sink(sink);

        listener.unregister(token);
        assert!(dispatch.sinks.lock().unwrap().contains_key(&token));

        // Advance the global epoch twice and re-enter so this listener's own local
        // epoch moves forward with it - two full cycles, matching the spec's
        // two-epoch quiescence bound.
        for _ in 0..2 {
            dispatch.epoch.global().advance();
            listener.local_epoch.enter(dispatch.epoch.global());
        }
        listener.advance_reclamation();

        assert!(!dispatch.sinks.lock().unwrap().contains_key(&token));
    }
}
