// SPDX-License-Identifier: Apache-2.0

//! Monotonic microsecond timer queue. See [`TimerQueue`].

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(PartialEq, Eq)]
struct Entry {
    deadline_us: u64,
    id: TimerId,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline_us
            .cmp(&other.deadline_us)
            .then_with(|| self.id.0.cmp(&other.id.0))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> { Some(self.cmp(other)) }
}

/// A time-ordered priority queue of deadlines. `arm` inserts a callback to run at an
/// absolute monotonic-microsecond deadline; `disarm` cancels it (lazily: the queue
/// entry is left in the heap but its callback is gone, so `tick` silently skips it);
/// `tick` fires and removes every entry whose deadline has passed.
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    callbacks: FxHashMap<TimerId, Box<dyn FnOnce() + Send>>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            callbacks: FxHashMap::default(),
            next_id: 0,
        }
    }

    /// Arms a timer to fire `callback` at `deadline_us` (absolute monotonic
    /// microseconds). `callback` must be `Send`: a `TimerQueue` itself only ever runs
    /// on the one context thread that owns it (§5), but it is moved across threads as
    /// part of that context at worker-spawn time (`domain::spawn_worker`), so every
    /// field - including queued callbacks - has to stay `Send` for that one transfer.
    /// Callers closing over a raw pointer that is only ever dereferenced on the
    /// owning thread (e.g. `Context::pause`'s strand pointer) wrap it in an
    /// explicitly-justified `Send` newtype rather than requiring this queue to give
    /// up `Send` itself.
    pub fn arm(&mut self, deadline_us: u64, callback: impl FnOnce() + Send + 'static) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(Reverse(Entry { deadline_us, id }));
        self.callbacks.insert(id, Box::new(callback));
        id
    }

    /// Cancels a timer. Returns `true` if it was still armed (not yet fired).
    pub fn disarm(&mut self, id: TimerId) -> bool { self.callbacks.remove(&id).is_some() }

    /// Fires every armed timer whose deadline is `<= now_us`, in deadline order, and
    /// removes them from the queue. Returns how many callbacks actually ran (disarmed
    /// entries still popped off the heap don't count).
    pub fn tick(&mut self, now_us: u64) -> usize {
        let mut fired = 0;
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.deadline_us > now_us {
                break;
            }
            let Reverse(entry) = self.heap.pop().expect("peek just confirmed an entry");
            if let Some(callback) = self.callbacks.remove(&entry.id) {
                callback();
                fired += 1;
            }
        }
        fired
    }

    /// The next deadline that would fire, if any armed timer remains. Used to compute
    /// the poll backend's timeout (§4.5: "time to next timer").
    pub fn next_deadline_us(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse(entry)| entry.deadline_us)
    }

    pub fn is_empty(&self) -> bool { self.callbacks.is_empty() }
}

impl Default for TimerQueue {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn fires_in_deadline_order() {
        let mut queue = TimerQueue::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        let o2 = Arc::clone(&order);
        queue.arm(200, move || o1.lock().unwrap().push("second"));
        queue.arm(100, move || o2.lock().unwrap().push("first"));

        assert_eq!(queue.tick(50), 0);
        assert_eq!(queue.tick(250), 2);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn disarm_then_tick_does_not_fire() {
        let mut queue = TimerQueue::new();
        let fired = Arc::new(AtomicU32::new(0));
        let fired_in_cb = Arc::clone(&fired);
        let id = queue.arm(100, move || {
            fired_in_cb.fetch_add(1, Ordering::SeqCst);
        });
        assert!(queue.disarm(id));
        assert_eq!(queue.tick(200), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn deadline_equal_to_now_fires() {
        let mut queue = TimerQueue::new();
        queue.arm(1_000, || {});
        assert_eq!(queue.tick(1_000), 1);
    }

    #[test]
    fn next_deadline_reflects_earliest_armed_timer() {
        let mut queue = TimerQueue::new();
        assert_eq!(queue.next_deadline_us(), None);
        queue.arm(500, || {});
        queue.arm(100, || {});
        assert_eq!(queue.next_deadline_us(), Some(100));
    }
}
