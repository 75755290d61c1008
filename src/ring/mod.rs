// SPDX-License-Identifier: Apache-2.0

//! Lock-free ring buffers: the transport underneath async calls, event forwarding, and
//! the combiner.

pub mod mpmc;
pub mod spsc;

pub use mpmc::MpmcRing;
pub use spsc::SpscRing;
