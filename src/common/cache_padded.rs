// SPDX-License-Identifier: Apache-2.0

//! False-sharing guard for hot ring-buffer cursors. See [`CachePadded`].

use std::ops::{Deref, DerefMut};

/// Wraps a value so it occupies a full cache line (128 bytes covers both the common
/// 64-byte line and Apple Silicon's 128-byte prefetch granularity).
///
/// Ring buffers keep the producer's `tail` and the consumer's `head` in separate
/// `CachePadded` cells; without this, the two cursors land on the same cache line and
/// every enqueue invalidates the consumer's cached read of `head` (and vice versa),
/// turning a lock-free ring into a false-sharing bottleneck indistinguishable from a
/// spinlock.
#[repr(C)]
#[repr(align(128))]
#[derive(Debug, Default)]
pub struct CachePadded<T>(T);

impl<T> CachePadded<T> {
    pub const fn new(value: T) -> Self { Self(value) }

    pub fn into_inner(self) -> T { self.0 }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;
    fn deref(&self) -> &T { &self.0 }
}

impl<T> DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut T { &mut self.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};

    #[test]
    fn pads_small_values_to_full_line() {
        assert_eq!(align_of::<CachePadded<u64>>(), 128);
        assert_eq!(size_of::<CachePadded<u64>>(), 128);
    }

    #[test]
    fn deref_reaches_inner_value() {
        let padded = CachePadded::new(7u32);
        assert_eq!(*padded, 7);
    }
}
