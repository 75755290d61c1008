// SPDX-License-Identifier: Apache-2.0

//! Cooperative stackful fibers: creation, scheduling, cancellation, and the strand
//! that drives them.

pub mod cancel;
pub mod current;
#[allow(clippy::module_inception)]
pub mod fiber;
pub mod strand;

pub use cancel::{CancelState, FiberExit};
pub use current::{cancel_state, exit, pause, testcancel, yield_now};
pub use fiber::{CleanupHandler, FiberId, FiberState};
pub use strand::Strand;
