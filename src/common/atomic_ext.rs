// SPDX-License-Identifier: Apache-2.0

//! Extension traits for the standard atomics used throughout the runtime. See
//! [`AtomicU8Ext`], [`AtomicU32Ext`], and [`AtomicU64Ext`].

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Ergonomic helpers for [`AtomicU8`] that hide the [`fetch_add`] return-value quirk.
///
/// [`AtomicU8::fetch_add`] returns the value *before* the add, not after. [`increment`]
/// derives the new value locally via [`u8::wrapping_add`] on the value it got back
/// rather than issuing a second load, which would race with another thread's increment
/// and could return a value that was never actually "ours".
///
/// [`fetch_add`]: AtomicU8::fetch_add
/// [`increment`]: Self::increment
pub trait AtomicU8Ext {
    /// Atomically increments the counter and returns the **new** value. Wraps from
    /// `255` to `0`.
    fn increment(&self) -> u8;
    fn get(&self) -> u8;
    fn set(&self, value: u8);
}

impl AtomicU8Ext for AtomicU8 {
    fn increment(&self) -> u8 { self.fetch_add(1, Ordering::SeqCst).wrapping_add(1) }
    fn get(&self) -> u8 { self.load(Ordering::SeqCst) }
    fn set(&self, value: u8) { self.store(value, Ordering::SeqCst) }
}

/// Same quirk, same fix, for the 32-bit epoch and bitmap counters.
pub trait AtomicU32Ext {
    fn increment(&self) -> u32;
    fn get(&self) -> u32;
    fn set(&self, value: u32);
}

impl AtomicU32Ext for AtomicU32 {
    fn increment(&self) -> u32 { self.fetch_add(1, Ordering::SeqCst).wrapping_add(1) }
    fn get(&self) -> u32 { self.load(Ordering::SeqCst) }
    fn set(&self, value: u32) { self.store(value, Ordering::SeqCst) }
}

/// Same quirk, same fix, for the 64-bit ring head/tail counters.
pub trait AtomicU64Ext {
    fn increment(&self) -> u64;
    fn get(&self) -> u64;
    fn set(&self, value: u64);
}

impl AtomicU64Ext for AtomicU64 {
    fn increment(&self) -> u64 { self.fetch_add(1, Ordering::SeqCst).wrapping_add(1) }
    fn get(&self) -> u64 { self.load(Ordering::SeqCst) }
    fn set(&self, value: u64) { self.store(value, Ordering::SeqCst) }
}
