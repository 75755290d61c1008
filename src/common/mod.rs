// SPDX-License-Identifier: Apache-2.0

//! Small foundation types shared by every other module: atomic helpers, cache-line
//! padding, and spin back-off escalation.

pub mod atomic_ext;
pub mod backoff;
pub mod cache_padded;
pub mod send_ptr;

pub use atomic_ext::{AtomicU32Ext, AtomicU64Ext, AtomicU8Ext};
pub use backoff::Backoff;
pub use cache_padded::CachePadded;
pub use send_ptr::SendPtr;
