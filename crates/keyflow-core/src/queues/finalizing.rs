//! Worker → driver conduit for events whose user callback has completed.
//!
//! Multiple workers submit; only the driver consumes. Submission never
//! blocks: the channel is unbounded, since depth is already bounded
//! upstream by per-key admission. The driver can drain non-blocking or wait with a
//! deadline when it has nothing else to do but must make progress.
//!
//! Per-worker submission order is preserved; interleavings across workers
//! are unspecified, which is fine because the driver re-serializes side
//! effects per event during finalization.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::event::AsyncEvent;

use super::QueueError;

/// Producer handle handed to the worker pool; cheap to clone.
pub struct FinalizingSink<K, V> {
    tx: Sender<Arc<AsyncEvent<K, V>>>,
}

impl<K, V> Clone for FinalizingSink<K, V> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<K, V> FinalizingSink<K, V> {
    /// Hands a processed event back to the driver. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Disconnected`] if the driver side is gone;
    /// the worker logs this and drops the event (the driver can no longer
    /// finalize anything).
    pub fn submit(&self, event: Arc<AsyncEvent<K, V>>) -> Result<(), QueueError> {
        self.tx.send(event).map_err(|_| QueueError::Disconnected)
    }
}

/// Consumer side, owned by the driver.
pub struct FinalizingQueue<K, V> {
    rx: Receiver<Arc<AsyncEvent<K, V>>>,
    sink: FinalizingSink<K, V>,
}

impl<K, V> FinalizingQueue<K, V> {
    /// Creates the queue and its producer handle.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            rx,
            sink: FinalizingSink { tx },
        }
    }

    /// A producer handle for the worker pool.
    #[must_use]
    pub fn sink(&self) -> FinalizingSink<K, V> {
        self.sink.clone()
    }

    /// True iff no submitted events are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Non-blocking receive; used by drain passes.
    #[must_use]
    pub fn try_next(&self) -> Option<Arc<AsyncEvent<K, V>>> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Blocking receive with a deadline. Returns `Ok(None)` on timeout.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Disconnected`] if every producer handle has
    /// been dropped; the pipeline can never make progress again.
    pub fn wait_next(
        &self,
        deadline: Duration,
    ) -> Result<Option<Arc<AsyncEvent<K, V>>>, QueueError> {
        match self.rx.recv_timeout(deadline) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(QueueError::Disconnected),
        }
    }
}

impl<K, V> Default for FinalizingQueue<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Record, RecordContext};
    use std::thread;

    fn event(key: &str) -> Arc<AsyncEvent<String, u32>> {
        AsyncEvent::new(
            Record::new(key.to_string(), 0, 0),
            0,
            RecordContext::default(),
            0,
            0,
            Box::new(|| {}),
        )
    }

    #[test]
    fn submit_then_try_next() {
        let q: FinalizingQueue<String, u32> = FinalizingQueue::new();
        assert!(q.is_empty());
        assert!(q.try_next().is_none());

        let e = event("a");
        q.sink().submit(Arc::clone(&e)).unwrap();
        assert!(!q.is_empty());
        assert_eq!(q.try_next().unwrap().id(), e.id());
        assert!(q.is_empty());
    }

    #[test]
    fn wait_next_times_out_when_idle() {
        let q: FinalizingQueue<String, u32> = FinalizingQueue::new();
        let got = q.wait_next(Duration::from_millis(10)).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn wait_next_wakes_on_submit_from_another_thread() {
        let q: FinalizingQueue<String, u32> = FinalizingQueue::new();
        let sink = q.sink();
        let e = event("a");
        let id = e.id();

        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sink.submit(e).unwrap();
        });

        let got = q.wait_next(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(got.id(), id);
        producer.join().unwrap();
    }

    #[test]
    fn per_producer_order_is_preserved() {
        let q: FinalizingQueue<String, u32> = FinalizingQueue::new();
        let sink = q.sink();
        let events: Vec<_> = (0..5).map(|_| event("k")).collect();
        for e in &events {
            sink.submit(Arc::clone(e)).unwrap();
        }
        for expected in &events {
            assert_eq!(q.try_next().unwrap().id(), expected.id());
        }
    }
}
