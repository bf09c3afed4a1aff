//! Driver-owned queue of offered events awaiting dispatch to the worker
//! pool.
//!
//! Selection rule: an event is *processable* when it is the oldest queued
//! event of its key and no earlier event of that key is still in flight
//! (dispatched but not yet `DONE`). A same-key successor therefore never
//! overtakes or runs concurrently with its predecessor, regardless of the
//! per-key admission cap. The cap (`max_events_per_key`) bounds how many
//! not-yet-done events a single key may have admitted at once and is what
//! the offer path's backpressure loop tests.
//!
//! Selection across keys is strict FIFO by offer order: the scan always
//! starts from the oldest queued event.
//!
//! Not thread-safe; owned and exclusively accessed by the driver thread.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Arc;

use fxhash::FxHashMap;

use crate::event::{AsyncEvent, EventState};

use super::QueueError;

/// Per-key occupancy counters.
#[derive(Debug, Default, Clone, Copy)]
struct KeyState {
    /// Events of this key currently sitting in the queue.
    queued: usize,
    /// Events of this key dispatched to the pool and not yet `DONE`.
    in_flight: usize,
}

impl KeyState {
    fn admitted(self) -> usize {
        self.queued + self.in_flight
    }

    fn is_idle(self) -> bool {
        self.queued == 0 && self.in_flight == 0
    }
}

/// Driver-owned scheduling queue with per-key ordering and bounded per-key
/// admission.
pub struct SchedulingQueue<K, V> {
    events: VecDeque<Arc<AsyncEvent<K, V>>>,
    keys: FxHashMap<K, KeyState>,
    max_events_per_key: usize,
}

impl<K, V> SchedulingQueue<K, V>
where
    K: Clone + Eq + Hash,
{
    /// Creates a queue admitting at most `max_events_per_key` not-yet-done
    /// events per key.
    #[must_use]
    pub fn new(max_events_per_key: usize) -> Self {
        Self {
            events: VecDeque::new(),
            keys: FxHashMap::default(),
            max_events_per_key,
        }
    }

    /// True iff no events are queued. In-flight events do not count; a key
    /// may still be blocked while the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of queued (not yet dispatched) events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Total events admitted for `key` and not yet `DONE` (queued plus
    /// dispatched).
    #[must_use]
    pub fn in_flight_for_key(&self, key: &K) -> usize {
        self.keys.get(key).map_or(0, |s| s.admitted())
    }

    /// True iff `key` has reached its admission cap. The offer path must
    /// drain the pipeline until this clears before offering another event
    /// of this key.
    #[must_use]
    pub fn key_queue_is_full(&self, key: &K) -> bool {
        self.in_flight_for_key(key) >= self.max_events_per_key
    }

    /// Appends an event, counting it against its key's admission cap.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::DuplicateEvent`] if the event is already
    /// queued, or [`QueueError::NotOfferable`] if it is not in `CREATED`.
    pub fn offer(&mut self, event: Arc<AsyncEvent<K, V>>) -> Result<(), QueueError> {
        let state = event.state();
        if state != EventState::Created {
            return Err(QueueError::NotOfferable {
                event_id: event.id(),
                state,
            });
        }
        if self.events.iter().any(|e| e.id() == event.id()) {
            return Err(QueueError::DuplicateEvent {
                event_id: event.id(),
            });
        }

        self.keys.entry(event.key().clone()).or_default().queued += 1;
        self.events.push_back(event);
        Ok(())
    }

    /// True iff some queued event is currently processable.
    #[must_use]
    pub fn has_processable(&self) -> bool {
        self.next_processable_index().is_some()
    }

    /// Removes and returns the oldest processable event, marking it
    /// dispatched for its key.
    pub fn poll(&mut self) -> Option<Arc<AsyncEvent<K, V>>> {
        let index = self.next_processable_index()?;
        let event = self.events.remove(index)?;
        let state = self
            .keys
            .get_mut(event.key())
            .expect("queued event has key state");
        state.queued -= 1;
        state.in_flight += 1;
        Some(event)
    }

    /// Releases one in-flight slot for `key`; called when an event of that
    /// key reaches `DONE`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::UnblockUnderflow`] if no event of that key was
    /// in flight.
    pub fn unblock_key(&mut self, key: &K) -> Result<(), QueueError> {
        let Some(state) = self.keys.get_mut(key) else {
            return Err(QueueError::UnblockUnderflow);
        };
        if state.in_flight == 0 {
            return Err(QueueError::UnblockUnderflow);
        }
        state.in_flight -= 1;
        if state.is_idle() {
            self.keys.remove(key);
        }
        Ok(())
    }

    /// Index of the oldest event whose key has nothing dispatched and no
    /// older queued entry. O(queue depth); depth is bounded by the per-key
    /// cap times the number of active keys, and the head is the common
    /// case.
    fn next_processable_index(&self) -> Option<usize> {
        for (index, event) in self.events.iter().enumerate() {
            let key = event.key();
            let state = self.keys.get(key).copied().unwrap_or_default();
            if state.in_flight > 0 {
                continue;
            }
            // Oldest-of-key check: an earlier queued event with the same
            // key claims the slot first.
            let blocked_by_earlier = self.events.iter().take(index).any(|e| e.key() == key);
            if !blocked_by_earlier {
                return Some(index);
            }
        }
        None
    }
}
