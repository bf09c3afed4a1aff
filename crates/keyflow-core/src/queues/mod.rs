//! # Pipeline Queues
//!
//! The two hand-off points of the async pipeline:
//!
//! - [`SchedulingQueue`]: driver-owned, driver-only. Holds offered events
//!   and selects which are processable under per-key ordering.
//! - [`FinalizingQueue`]: the worker → driver conduit. Workers submit
//!   events whose user callback has completed; the driver drains them to
//!   replay side effects.
//!
//! Together with the worker pool's task channel these are the *only*
//! synchronisation points between the driver and the workers.

mod finalizing;
mod scheduling;

pub use finalizing::{FinalizingQueue, FinalizingSink};
pub use scheduling::SchedulingQueue;

use crate::event::EventState;

/// Errors raised by the pipeline queues.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The same event was offered to the scheduling queue twice.
    #[error("event {event_id} is already queued")]
    DuplicateEvent {
        /// Id of the offending event.
        event_id: u64,
    },

    /// An event was offered in a state other than `CREATED`.
    #[error("event {event_id} cannot be offered in state {state}")]
    NotOfferable {
        /// Id of the offending event.
        event_id: u64,
        /// State the event was in.
        state: EventState,
    },

    /// A key was unblocked that had no in-flight events.
    #[error("no in-flight events recorded for the unblocked key")]
    UnblockUnderflow,

    /// The finalizing channel was torn down while the driver still needed
    /// it. The driver cannot uphold its pre-commit contract past this
    /// point.
    #[error("finalizing queue disconnected")]
    Disconnected,
}
