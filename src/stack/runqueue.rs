// SPDX-License-Identifier: Apache-2.0

//! 32-bin priority runqueue with a bitmap index. See [`Runqueue`].
//!
//! Priority 0 is highest (run first), priority 31 is the boot fiber's reserved slot.
//! The bitmap lets [`Runqueue::get`] find the highest-priority non-empty bin in
//! constant time via `trailing_zeros` instead of scanning all 32 bins.

use std::collections::VecDeque;

pub const PRIORITY_COUNT: usize = 32;
pub const PRIORITY_HIGHEST: u8 = 0;
pub const PRIORITY_WORKER: u8 = 16;
pub const PRIORITY_BOOT: u8 = 31;

/// A priority-binned ready queue. Bit `i` of the internal bitmap is set if and only if
/// bin `i` is non-empty; [`Self::get`] always returns a fiber from the lowest-index
/// (highest-priority) non-empty bin.
pub struct Runqueue<T> {
    bins: [VecDeque<T>; PRIORITY_COUNT],
    bitmap: u32,
}

impl<T> Runqueue<T> {
    pub fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| VecDeque::new()),
            bitmap: 0,
        }
    }

    /// Appends `item` to the back of bin `priority`.
    ///
    /// # Panics
    ///
    /// Panics if `priority >= PRIORITY_COUNT`.
    pub fn put(&mut self, priority: u8, item: T) {
        let bin = &mut self.bins[priority as usize];
        bin.push_back(item);
        self.bitmap |= 1 << priority;
    }

    /// Removes and returns an item from the highest-priority non-empty bin, along with
    /// the priority it was dequeued from.
    pub fn get(&mut self) -> Option<(u8, T)> {
        if self.bitmap == 0 {
            return None;
        }
        let priority = self.bitmap.trailing_zeros() as u8;
        let bin = &mut self.bins[priority as usize];
        let item = bin.pop_front().expect("bitmap bit set implies non-empty bin");
        if bin.is_empty() {
            self.bitmap &= !(1 << priority);
        }
        Some((priority, item))
    }

    pub fn is_empty(&self) -> bool { self.bitmap == 0 }

    pub fn len(&self) -> usize { self.bins.iter().map(VecDeque::len).sum() }

    /// Asserts the bitmap invariant: bit `i` set iff bin `i` non-empty. Used by tests
    /// and debug assertions at call sites that mutate the runqueue directly.
    pub fn invariant_holds(&self) -> bool {
        (0..PRIORITY_COUNT).all(|i| ((self.bitmap >> i) & 1 == 1) == !self.bins[i].is_empty())
    }
}

impl<T: PartialEq> Runqueue<T> {
    /// Removes the first occurrence of `item` from bin `priority`, if present. Used
    /// when hoisting a fiber: it must be removed from its original-priority bin before
    /// being re-queued at the hoisted priority.
    pub fn delete(&mut self, priority: u8, item: &T) -> bool {
        let bin = &mut self.bins[priority as usize];
        if let Some(pos) = bin.iter().position(|candidate| candidate == item) {
            bin.remove(pos);
            if bin.is_empty() {
                self.bitmap &= !(1 << priority);
            }
            true
        } else {
            false
        }
    }
}

impl<T> Default for Runqueue<T> {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_priority_dequeued_first() {
        let mut rq = Runqueue::new();
        rq.put(5, "low");
        rq.put(0, "high");
        rq.put(3, "mid");
        assert_eq!(rq.get(), Some((0, "high")));
        assert_eq!(rq.get(), Some((3, "mid")));
        assert_eq!(rq.get(), Some((5, "low")));
        assert_eq!(rq.get(), None);
    }

    #[test]
    fn fifo_within_same_priority() {
        let mut rq = Runqueue::new();
        rq.put(1, "a");
        rq.put(1, "b");
        assert_eq!(rq.get(), Some((1, "a")));
        assert_eq!(rq.get(), Some((1, "b")));
    }

    #[test]
    fn bitmap_invariant_holds_through_operations() {
        let mut rq: Runqueue<u32> = Runqueue::new();
        assert!(rq.invariant_holds());
        rq.put(10, 1);
        assert!(rq.invariant_holds());
        rq.put(10, 2);
        rq.delete(10, &1);
        assert!(rq.invariant_holds());
        rq.delete(10, &2);
        assert!(rq.invariant_holds());
        assert!(rq.is_empty());
    }

    #[test]
    fn delete_missing_item_returns_false() {
        let mut rq: Runqueue<u32> = Runqueue::new();
        rq.put(4, 100);
        assert!(!rq.delete(4, &999));
        assert!(rq.delete(4, &100));
    }
}
