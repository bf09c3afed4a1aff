//! # Context Router
//!
//! The processing context handed to user code. Every call is routed by the
//! identity of the calling thread:
//!
//! 1. If the current thread has a worker delegate installed (it is a pool
//!    worker inside the user callback), the call is served from the event
//!    being processed: forwards and writes are intercepted onto the event,
//!    and metadata/clock queries answer with the snapshots captured when the
//!    event was offered, never live host values.
//! 2. Otherwise the call is served by the driver delegate, which wraps the
//!    real host context. This is the path taken inside the user's `init`
//!    and `close`, and by the driver itself during finalization.
//!
//! The router starts in *setup* mode; state stores may only be opened then.
//! After `init` completes the coordinator switches it to *processing* mode
//! (idempotent), at which point store opening is refused.
//!
//! The router never holds a reference back to the coordinator: workers are
//! found by thread identity, and store wrappers hold a weak reference to
//! the router, so teardown is acyclic.

use std::hash::Hash;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};

use crate::event::{AsyncEvent, DelayedForward, DelayedWrite};
use crate::host::{
    AppConfigs, Cancellable, DriverContext, Headers, Record, RecordMetadata, TaskId, TickCallback,
};
use crate::store::{AsyncKeyValueStore, StoreError};

/// Errors raised by context routing.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// `state_store` was called outside the user's `init`.
    #[error("state store {name} must be opened during init, before processing begins")]
    StoreAccessOutsideInit {
        /// The requested store name.
        name: String,
    },

    /// The host has no store connected under the requested name.
    #[error("state store {name} is not connected to this processor")]
    StoreNotConnected {
        /// The requested store name.
        name: String,
    },
}

/// Routing mode; see the module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Setup,
    Processing,
}

const MODE_SETUP: u8 = 0;
const MODE_PROCESSING: u8 = 1;

/// Driver-side delegate state: the real host context plus the stores the
/// user opened during `init`.
struct DriverState<K, V> {
    host: Box<dyn DriverContext<K, V>>,
    stores: FxHashMap<String, Arc<AsyncKeyValueStore<K, V>>>,
}

/// Worker-side delegate: everything a call inside the user callback may
/// touch, scoped to one event for the duration of one callback.
struct WorkerDelegate<K, V> {
    event: Arc<AsyncEvent<K, V>>,
}

impl<K, V> Clone for WorkerDelegate<K, V> {
    fn clone(&self) -> Self {
        Self {
            event: Arc::clone(&self.event),
        }
    }
}

/// The user-facing processing context; routes each call to the driver or a
/// worker delegate by thread identity.
pub struct AsyncProcessorContext<K, V> {
    driver: Mutex<DriverState<K, V>>,
    workers: RwLock<FxHashMap<ThreadId, WorkerDelegate<K, V>>>,
    mode: AtomicU8,
    task_id: TaskId,
    node_name: String,
    app_configs: AppConfigs,
}

impl<K, V> AsyncProcessorContext<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Wraps the host context. The returned router serves the driver
    /// delegate until workers install themselves.
    pub(crate) fn new(host: Box<dyn DriverContext<K, V>>) -> Arc<Self> {
        let task_id = host.task_id();
        let node_name = host.current_node_name();
        let app_configs = host.app_configs();
        Arc::new(Self {
            driver: Mutex::new(DriverState {
                host,
                stores: FxHashMap::default(),
            }),
            workers: RwLock::new(FxHashMap::default()),
            mode: AtomicU8::new(MODE_SETUP),
            task_id,
            node_name,
            app_configs,
        })
    }

    // ---- user-facing API -------------------------------------------------

    /// Forwards a record to all downstream children.
    ///
    /// From a worker callback the forward is intercepted onto the current
    /// event and executed on the driver thread at finalization, in
    /// submission order.
    ///
    /// # Errors
    ///
    /// Propagates host delivery failures on the driver path; interception
    /// itself only fails on runtime bugs.
    pub fn forward(&self, record: Record<K, V>) -> crate::Result<()> {
        self.forward_internal(record, None)
    }

    /// Forwards a record to a single named downstream child.
    ///
    /// # Errors
    ///
    /// As [`Self::forward`]; additionally the host rejects unknown child
    /// names (at finalization time when called from a worker).
    pub fn forward_to(&self, record: Record<K, V>, child: &str) -> crate::Result<()> {
        self.forward_internal(record, Some(child.to_string()))
    }

    fn forward_internal(&self, record: Record<K, V>, child: Option<String>) -> crate::Result<()> {
        if let Some(delegate) = self.worker_delegate() {
            delegate
                .event
                .append_forward(DelayedForward { record, child })?;
            return Ok(());
        }
        let mut driver = self.driver.lock();
        driver.host.forward(record, child.as_deref())?;
        Ok(())
    }

    /// Opens a state store by name. Only valid during the user's `init`.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::StoreAccessOutsideInit`] after `init`, or
    /// [`ContextError::StoreNotConnected`] if the host has no such store.
    pub fn state_store(
        self: &Arc<Self>,
        name: &str,
    ) -> crate::Result<Arc<AsyncKeyValueStore<K, V>>> {
        if self.current_mode() != Mode::Setup || self.worker_delegate().is_some() {
            return Err(ContextError::StoreAccessOutsideInit {
                name: name.to_string(),
            }
            .into());
        }

        let mut driver = self.driver.lock();
        if let Some(existing) = driver.stores.get(name) {
            return Ok(Arc::clone(existing));
        }
        let backing =
            driver
                .host
                .get_state_store(name)
                .ok_or_else(|| ContextError::StoreNotConnected {
                    name: name.to_string(),
                })?;
        let store = Arc::new(AsyncKeyValueStore::new(
            name.to_string(),
            backing,
            Arc::downgrade(self),
        ));
        driver.stores.insert(name.to_string(), Arc::clone(&store));
        Ok(store)
    }

    /// Source coordinates of the record in scope, if it came from an input
    /// topic. From a worker this is the offer-time snapshot.
    #[must_use]
    pub fn record_metadata(&self) -> Option<RecordMetadata> {
        if let Some(delegate) = self.worker_delegate() {
            return delegate.event.record_context().metadata();
        }
        self.driver.lock().host.record_context().metadata()
    }

    /// Topic of the record in scope.
    #[must_use]
    pub fn topic(&self) -> Option<String> {
        if let Some(delegate) = self.worker_delegate() {
            return delegate.event.record_context().topic.clone();
        }
        self.driver.lock().host.record_context().topic
    }

    /// Offset of the record in scope.
    #[must_use]
    pub fn offset(&self) -> i64 {
        if let Some(delegate) = self.worker_delegate() {
            return delegate.event.record_context().offset;
        }
        self.driver.lock().host.record_context().offset
    }

    /// Timestamp of the record in scope.
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        if let Some(delegate) = self.worker_delegate() {
            return delegate.event.record_context().timestamp;
        }
        self.driver.lock().host.record_context().timestamp
    }

    /// Headers of the record in scope.
    #[must_use]
    pub fn headers(&self) -> Headers {
        if let Some(delegate) = self.worker_delegate() {
            return delegate.event.record_context().headers.clone();
        }
        self.driver.lock().host.record_context().headers
    }

    /// Stream time: live from the host on the driver, the offer-time
    /// snapshot from a worker.
    #[must_use]
    pub fn current_stream_time_ms(&self) -> i64 {
        if let Some(delegate) = self.worker_delegate() {
            return delegate.event.stream_time_at_offer();
        }
        self.driver.lock().host.current_stream_time_ms()
    }

    /// System time: live from the host on the driver, the offer-time
    /// snapshot from a worker.
    #[must_use]
    pub fn current_system_time_ms(&self) -> i64 {
        if let Some(delegate) = self.worker_delegate() {
            return delegate.event.system_time_at_offer();
        }
        self.driver.lock().host.current_system_time_ms()
    }

    /// Identity of the hosting task.
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Partition owned by the hosting task.
    #[must_use]
    pub fn partition(&self) -> i32 {
        self.task_id.partition
    }

    /// Name of the processor node.
    #[must_use]
    pub fn current_node_name(&self) -> &str {
        &self.node_name
    }

    /// The application configuration, as captured at init.
    #[must_use]
    pub fn app_configs(&self) -> AppConfigs {
        self.app_configs.clone()
    }

    // ---- routing internals ----------------------------------------------

    fn current_mode(&self) -> Mode {
        if self.mode.load(Ordering::Acquire) == MODE_PROCESSING {
            Mode::Processing
        } else {
            Mode::Setup
        }
    }

    /// Switches to processing mode. Idempotent.
    pub(crate) fn enable_processing_mode(&self) {
        self.mode.store(MODE_PROCESSING, Ordering::Release);
    }

    /// Installs the worker delegate for the current thread for the duration
    /// of one callback.
    pub(crate) fn install_worker_delegate(&self, event: Arc<AsyncEvent<K, V>>) {
        let previous = self
            .workers
            .write()
            .insert(thread::current().id(), WorkerDelegate { event });
        if previous.is_some() {
            tracing::error!(
                processor = %self.node_name,
                "worker delegate installed over a live delegate; a previous \
                 callback did not clean up"
            );
        }
    }

    /// Removes the current thread's worker delegate.
    pub(crate) fn remove_worker_delegate(&self) {
        self.workers.write().remove(&thread::current().id());
    }

    fn worker_delegate(&self) -> Option<WorkerDelegate<K, V>> {
        self.workers.read().get(&thread::current().id()).cloned()
    }

    /// The event being processed on the current thread, if this thread is a
    /// worker inside a callback. Used by store wrappers to intercept
    /// writes.
    pub(crate) fn current_worker_event(&self) -> Option<Arc<AsyncEvent<K, V>>> {
        self.worker_delegate().map(|d| d.event)
    }

    /// Number of live worker delegates across all threads.
    #[cfg(test)]
    pub(crate) fn worker_delegate_count(&self) -> usize {
        self.workers.read().len()
    }

    // ---- driver-side services for the coordinator ------------------------

    /// Timestamp of the host's current record context; used for direct
    /// (non-intercepted) writes from the driver.
    pub(crate) fn driver_record_timestamp(&self) -> i64 {
        self.driver.lock().host.record_context().timestamp
    }

    /// Restores `event`'s captured record context onto the host, so that
    /// every side effect replayed next runs under the context the record
    /// was offered with.
    pub(crate) fn prepare_finalize(&self, event: &AsyncEvent<K, V>) {
        self.driver
            .lock()
            .host
            .set_record_context(event.record_context().clone());
    }

    /// Executes one intercepted forward against the real host context.
    pub(crate) fn execute_forward(&self, forward: DelayedForward<K, V>) -> crate::Result<()> {
        let mut driver = self.driver.lock();
        driver
            .host
            .forward(forward.record, forward.child.as_deref())?;
        Ok(())
    }

    /// Executes one intercepted write against the backing store.
    pub(crate) fn execute_write(&self, write: DelayedWrite) -> crate::Result<()> {
        let driver = self.driver.lock();
        let store =
            driver
                .stores
                .get(&write.store_name)
                .ok_or_else(|| StoreError::UnknownStore {
                    name: write.store_name.clone(),
                })?;
        match write.value {
            Some(value) => store.backing().put(write.key, value, write.timestamp)?,
            None => store.backing().delete(write.key)?,
        }
        Ok(())
    }

    /// Snapshots of host state taken on the driver in the offer path.
    pub(crate) fn offer_snapshot(&self) -> (crate::host::RecordContext, i64, i64) {
        let driver = self.driver.lock();
        (
            driver.host.record_context(),
            driver.host.current_stream_time_ms(),
            driver.host.current_system_time_ms(),
        )
    }

    /// Registers the periodic drain tick with the host.
    pub(crate) fn schedule_tick(
        &self,
        interval: Duration,
        callback: TickCallback,
    ) -> Box<dyn Cancellable> {
        self.driver.lock().host.schedule(interval, callback)
    }

    /// Names of the stores the user opened during `init`, for verification
    /// against the declared set.
    pub(crate) fn opened_store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.driver.lock().stores.keys().cloned().collect();
        names.sort();
        names
    }
}

impl<K, V> std::fmt::Debug for AsyncProcessorContext<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncProcessorContext")
            .field("task_id", &self.task_id)
            .field("node_name", &self.node_name)
            .field("mode", &self.mode.load(Ordering::Relaxed))
            .field("worker_delegates", &self.workers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventState;
    use crate::host::RecordContext;
    use crate::testing::MockDriverContext;

    type Ctx = AsyncProcessorContext<String, String>;

    fn record(key: &str, value: &str) -> Record<String, String> {
        Record::new(key.to_string(), value.to_string(), 10)
    }

    fn processing_event(key: &str) -> Arc<AsyncEvent<String, String>> {
        let ctx = RecordContext {
            topic: Some("in".to_string()),
            partition: 0,
            offset: 7,
            timestamp: 1_234,
            headers: Vec::new(),
        };
        let e = AsyncEvent::new(record(key, "v"), 0, ctx, 55, 66, Box::new(|| {}));
        e.transition(EventState::ToProcess).unwrap();
        e.transition(EventState::Processing).unwrap();
        e
    }

    #[test]
    fn driver_calls_reach_the_host() {
        let mock = MockDriverContext::new();
        let router: Arc<Ctx> = AsyncProcessorContext::new(Box::new(mock.context()));

        router.forward(record("a", "out")).unwrap();
        assert_eq!(mock.forwarded().len(), 1);
    }

    #[test]
    fn worker_delegate_intercepts_forwards() {
        let mock = MockDriverContext::new();
        let router: Arc<Ctx> = AsyncProcessorContext::new(Box::new(mock.context()));
        let event = processing_event("a");

        router.install_worker_delegate(Arc::clone(&event));
        router.forward(record("a", "out")).unwrap();
        router.remove_worker_delegate();

        // Intercepted, not executed.
        assert!(mock.forwarded().is_empty());
        event.transition(EventState::ToFinalize).unwrap();
        event.transition(EventState::Finalizing).unwrap();
        let forward = event.next_forward().unwrap().unwrap();
        assert_eq!(forward.record.value, "out");
    }

    #[test]
    fn worker_metadata_serves_offer_snapshots() {
        let mock = MockDriverContext::new();
        mock.set_stream_time(9_999);
        let router: Arc<Ctx> = AsyncProcessorContext::new(Box::new(mock.context()));
        let event = processing_event("a");

        router.install_worker_delegate(Arc::clone(&event));
        assert_eq!(router.current_stream_time_ms(), 55);
        assert_eq!(router.current_system_time_ms(), 66);
        assert_eq!(router.offset(), 7);
        assert_eq!(router.timestamp(), 1_234);
        assert_eq!(router.topic().as_deref(), Some("in"));
        let meta = router.record_metadata().unwrap();
        assert_eq!(meta.offset, 7);
        router.remove_worker_delegate();

        // Back on the driver path, live host values are visible again.
        assert_eq!(router.current_stream_time_ms(), 9_999);
    }

    #[test]
    fn store_access_is_init_only() {
        let mock = MockDriverContext::new();
        mock.add_store("kv");
        let router: Arc<Ctx> = AsyncProcessorContext::new(Box::new(mock.context()));

        assert!(router.state_store("kv").is_ok());
        router.enable_processing_mode();
        let err = router.state_store("kv").unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Context(ContextError::StoreAccessOutsideInit { .. })
        ));
    }

    #[test]
    fn unconnected_store_is_reported() {
        let mock = MockDriverContext::new();
        let router: Arc<Ctx> = AsyncProcessorContext::new(Box::new(mock.context()));
        let err = router.state_store("missing").unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Context(ContextError::StoreNotConnected { .. })
        ));
    }

    #[test]
    fn reopening_a_store_returns_the_same_wrapper() {
        let mock = MockDriverContext::new();
        mock.add_store("kv");
        let router: Arc<Ctx> = AsyncProcessorContext::new(Box::new(mock.context()));

        let a = router.state_store("kv").unwrap();
        let b = router.state_store("kv").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(router.opened_store_names(), vec!["kv".to_string()]);
    }

    #[test]
    fn prepare_finalize_restores_event_context() {
        let mock = MockDriverContext::new();
        let router: Arc<Ctx> = AsyncProcessorContext::new(Box::new(mock.context()));
        let event = processing_event("a");

        router.prepare_finalize(&event);
        assert_eq!(mock.record_context().offset, 7);
        assert_eq!(mock.record_context().topic.as_deref(), Some("in"));
    }
}
