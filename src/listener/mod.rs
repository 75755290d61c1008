// SPDX-License-Identifier: Apache-2.0

//! The event dispatcher: a shared poll backend plus one listener per context,
//! delivering readiness directly to the owning context or forwarding it to a peer's
//! listener when ownership crosses threads (§4.5).

pub mod backend;
pub mod dispatch;
pub mod sink;

pub use backend::{MioBackend, PollBackend};
pub use dispatch::{Dispatch, Listener};
pub use sink::{ContextId, EventSink, SinkFlags};
