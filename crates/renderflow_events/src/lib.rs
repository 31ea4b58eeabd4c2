//! Event streaming primitives for Renderflow.
//!
//! Two independent pieces live here:
//! - [`EventBuffer`]: a bounded, append-only, topic-keyed log used by the
//!   analytics pipeline (capture appends, transfer drains, trim bounds).
//! - [`ProgressBus`]: topic-keyed publish/subscribe used to fan per-job
//!   status updates out to the relay. Best-effort, no replay.

pub mod buffer;
pub mod bus;

pub use buffer::{EventBuffer, EventBufferEntry, StreamId};
pub use bus::{ProgressBus, Subscription};
