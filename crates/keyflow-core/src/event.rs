//! # Async Event
//!
//! The lifecycle token for one input record as it moves through the
//! pipeline. An event is created on the driver thread when a record is
//! offered, handed to a worker for user processing, and handed back to the
//! driver for finalization.
//!
//! ## Lifecycle
//!
//! ```text
//! CREATED → TO_PROCESS → PROCESSING → TO_FINALIZE → FINALIZING → DONE
//!  driver     driver       worker        worker       driver     driver
//! ```
//!
//! Transitions are strictly monotonic and single-step; any other transition
//! is a programming error inside the runtime, never a user-visible
//! condition.
//!
//! ## Side-effect buffers
//!
//! While an event is `PROCESSING`, the worker-side context delegate appends
//! every intercepted forward and store write to the event. While it is
//! `FINALIZING`, the driver drains both buffers in submission order and
//! replays them against the real host context. The buffers are never
//! touched from both sides at once: the hand-off through the finalizing
//! queue provides the happens-before edge.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::host::{Record, RecordContext};

/// Monotonic id source for events, process-wide.
static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(0);

/// Errors raised by event lifecycle misuse.
///
/// These always indicate a bug in the runtime (or a test driving it out of
/// order), and are fatal for the processor instance that observes them.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// A state transition that is not the single allowed successor.
    #[error("event {event_id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        /// Id of the event.
        event_id: u64,
        /// State the event was in.
        from: EventState,
        /// State the transition targeted.
        to: EventState,
    },

    /// A side-effect buffer was touched outside its allowed phase.
    #[error("event {event_id}: {operation} is not allowed in state {state}")]
    WrongPhase {
        /// Id of the event.
        event_id: u64,
        /// The operation that was attempted.
        operation: &'static str,
        /// State the event was in.
        state: EventState,
    },

    /// The user callback was requested a second time.
    #[error("event {event_id}: user callback already consumed")]
    CallbackConsumed {
        /// Id of the event.
        event_id: u64,
    },
}

/// Lifecycle state of an [`AsyncEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventState {
    /// Created on the driver, not yet selected for processing.
    Created,
    /// Selected from the scheduling queue, about to be handed to the pool.
    ToProcess,
    /// A worker is running the user callback.
    Processing,
    /// The callback returned; the event is waiting in the finalizing queue.
    ToFinalize,
    /// The driver is replaying the event's side effects.
    Finalizing,
    /// Fully complete; the event's key is unblocked.
    Done,
}

impl EventState {
    fn successor(self) -> Option<EventState> {
        match self {
            EventState::Created => Some(EventState::ToProcess),
            EventState::ToProcess => Some(EventState::Processing),
            EventState::Processing => Some(EventState::ToFinalize),
            EventState::ToFinalize => Some(EventState::Finalizing),
            EventState::Finalizing => Some(EventState::Done),
            EventState::Done => None,
        }
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventState::Created => "CREATED",
            EventState::ToProcess => "TO_PROCESS",
            EventState::Processing => "PROCESSING",
            EventState::ToFinalize => "TO_FINALIZE",
            EventState::Finalizing => "FINALIZING",
            EventState::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// A forward intercepted during user processing, to be replayed on the
/// driver thread at finalization.
#[derive(Debug, Clone)]
pub struct DelayedForward<K, V> {
    /// The record to forward.
    pub record: Record<K, V>,
    /// Downstream child to forward to, or all children when `None`.
    pub child: Option<String>,
}

/// A store write intercepted during user processing, to be replayed on the
/// driver thread at finalization.
#[derive(Debug, Clone)]
pub struct DelayedWrite {
    /// Name of the store the write targets.
    pub store_name: String,
    /// Serialized key.
    pub key: Bytes,
    /// Serialized value, or `None` for a tombstone (delete).
    pub value: Option<Bytes>,
    /// Write timestamp in epoch milliseconds.
    pub timestamp: i64,
}

/// The user's process logic for one record, deferred until a worker picks
/// the event up.
pub type ProcessCallback = Box<dyn FnOnce() + Send>;

/// Interior state that changes over the event's life.
struct Inner<K, V> {
    state: EventState,
    callback: Option<ProcessCallback>,
    forwards: VecDeque<DelayedForward<K, V>>,
    writes: VecDeque<DelayedWrite>,
    failure: Option<String>,
}

/// Lifecycle token wrapping one input record and its intercepted side
/// effects.
///
/// Events are shared by reference count between the queues, the worker
/// executing the callback, and the driver's pending set; the state machine
/// guarantees only one of them acts on the event at a time.
pub struct AsyncEvent<K, V> {
    id: u64,
    key: K,
    record: Record<K, V>,
    partition: i32,
    record_context: RecordContext,
    stream_time_at_offer: i64,
    system_time_at_offer: i64,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> AsyncEvent<K, V>
where
    K: Clone,
{
    /// Creates a new event in state [`EventState::Created`], capturing the
    /// record context and clock snapshots taken on the driver at offer
    /// time.
    pub fn new(
        record: Record<K, V>,
        partition: i32,
        record_context: RecordContext,
        stream_time_at_offer: i64,
        system_time_at_offer: i64,
        callback: ProcessCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
            key: record.key.clone(),
            record,
            partition,
            record_context,
            stream_time_at_offer,
            system_time_at_offer,
            inner: Mutex::new(Inner {
                state: EventState::Created,
                callback: Some(callback),
                forwards: VecDeque::new(),
                writes: VecDeque::new(),
                failure: None,
            }),
        })
    }
}

impl<K, V> AsyncEvent<K, V> {
    /// Unique id of this event.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Key of the input record.
    #[must_use]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The input record.
    #[must_use]
    pub fn input_record(&self) -> &Record<K, V> {
        &self.record
    }

    /// Partition of the task that owns this event.
    #[must_use]
    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// The host metadata captured when this event was offered.
    #[must_use]
    pub fn record_context(&self) -> &RecordContext {
        &self.record_context
    }

    /// Stream time snapshotted at offer.
    #[must_use]
    pub fn stream_time_at_offer(&self) -> i64 {
        self.stream_time_at_offer
    }

    /// System time snapshotted at offer.
    #[must_use]
    pub fn system_time_at_offer(&self) -> i64 {
        self.system_time_at_offer
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EventState {
        self.inner.lock().state
    }

    /// Advances the lifecycle to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::IllegalTransition`] unless `to` is the single
    /// allowed successor of the current state.
    pub fn transition(&self, to: EventState) -> Result<(), EventError> {
        let mut inner = self.inner.lock();
        if inner.state.successor() == Some(to) {
            inner.state = to;
            Ok(())
        } else {
            Err(EventError::IllegalTransition {
                event_id: self.id,
                from: inner.state,
                to,
            })
        }
    }

    /// Takes the user callback for execution. Valid exactly once, while the
    /// event is `PROCESSING`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::CallbackConsumed`] on a second take, or
    /// [`EventError::WrongPhase`] outside `PROCESSING`.
    pub fn take_callback(&self) -> Result<ProcessCallback, EventError> {
        let mut inner = self.inner.lock();
        if inner.state != EventState::Processing {
            return Err(EventError::WrongPhase {
                event_id: self.id,
                operation: "take_callback",
                state: inner.state,
            });
        }
        inner
            .callback
            .take()
            .ok_or(EventError::CallbackConsumed { event_id: self.id })
    }

    /// Appends an intercepted forward. Worker-side, `PROCESSING` only.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::WrongPhase`] outside `PROCESSING`.
    pub fn append_forward(&self, forward: DelayedForward<K, V>) -> Result<(), EventError> {
        let mut inner = self.inner.lock();
        if inner.state != EventState::Processing {
            return Err(EventError::WrongPhase {
                event_id: self.id,
                operation: "append_forward",
                state: inner.state,
            });
        }
        inner.forwards.push_back(forward);
        Ok(())
    }

    /// Appends an intercepted store write. Worker-side, `PROCESSING` only.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::WrongPhase`] outside `PROCESSING`.
    pub fn append_write(&self, write: DelayedWrite) -> Result<(), EventError> {
        let mut inner = self.inner.lock();
        if inner.state != EventState::Processing {
            return Err(EventError::WrongPhase {
                event_id: self.id,
                operation: "append_write",
                state: inner.state,
            });
        }
        inner.writes.push_back(write);
        Ok(())
    }

    /// Pops the next pending forward in submission order. Driver-side,
    /// `FINALIZING` only.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::WrongPhase`] outside `FINALIZING`.
    pub fn next_forward(&self) -> Result<Option<DelayedForward<K, V>>, EventError> {
        let mut inner = self.inner.lock();
        if inner.state != EventState::Finalizing {
            return Err(EventError::WrongPhase {
                event_id: self.id,
                operation: "next_forward",
                state: inner.state,
            });
        }
        Ok(inner.forwards.pop_front())
    }

    /// Pops the next pending write in submission order. Driver-side,
    /// `FINALIZING` only.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::WrongPhase`] outside `FINALIZING`.
    pub fn next_write(&self) -> Result<Option<DelayedWrite>, EventError> {
        let mut inner = self.inner.lock();
        if inner.state != EventState::Finalizing {
            return Err(EventError::WrongPhase {
                event_id: self.id,
                operation: "next_write",
                state: inner.state,
            });
        }
        Ok(inner.writes.pop_front())
    }

    /// Records a user-callback failure on the event. The driver surfaces it
    /// when the event is dequeued for finalization.
    pub fn record_failure(&self, message: impl Into<String>) {
        self.inner.lock().failure = Some(message.into());
    }

    /// The recorded user-callback failure, if any.
    #[must_use]
    pub fn failure(&self) -> Option<String> {
        self.inner.lock().failure.clone()
    }
}

impl<K: fmt::Debug, V> fmt::Debug for AsyncEvent<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncEvent")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("partition", &self.partition)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
