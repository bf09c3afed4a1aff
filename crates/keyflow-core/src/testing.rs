//! Testing utilities for the async pipeline.
//!
//! Provides a scriptable mock of the host driver context and an in-memory
//! backing store, shared by this crate's unit and scenario tests and usable
//! by downstream crates testing their own processors.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::host::{
    AppConfigs, Cancellable, DriverContext, HostError, Record, RecordContext, TaskId, TickCallback,
};
use crate::store::{RemoteKeyValueStore, StoreError};

/// A forward executed against the mock host, with the record context that
/// was live at execution time.
#[derive(Debug, Clone)]
pub struct ForwardedRecord<K, V> {
    /// The forwarded record.
    pub record: Record<K, V>,
    /// Target child, if the forward was addressed.
    pub child: Option<String>,
    /// The host's record context at the moment of the forward. Assertions
    /// use this to prove context restoration.
    pub context: RecordContext,
}

/// A write applied to an [`InMemoryRemoteStore`], in application order.
#[derive(Debug, Clone)]
pub struct StoreWrite {
    /// The written key.
    pub key: Bytes,
    /// The written value, or `None` for a delete.
    pub value: Option<Bytes>,
    /// The write timestamp.
    pub timestamp: i64,
}

/// Thread-safe in-memory implementation of [`RemoteKeyValueStore`] that
/// records every write in application order.
#[derive(Debug, Default)]
pub struct InMemoryRemoteStore {
    data: Mutex<BTreeMap<Vec<u8>, Bytes>>,
    write_log: Mutex<Vec<StoreWrite>>,
}

impl InMemoryRemoteStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write applied so far, in order.
    #[must_use]
    pub fn write_log(&self) -> Vec<StoreWrite> {
        self.write_log.lock().clone()
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// True iff the store holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

impl RemoteKeyValueStore for InMemoryRemoteStore {
    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.data.lock().get(key).cloned()
    }

    fn put(&self, key: Bytes, value: Bytes, timestamp: i64) -> Result<(), StoreError> {
        self.data.lock().insert(key.to_vec(), value.clone());
        self.write_log.lock().push(StoreWrite {
            key,
            value: Some(value),
            timestamp,
        });
        Ok(())
    }

    fn delete(&self, key: Bytes) -> Result<(), StoreError> {
        self.data.lock().remove(key.as_ref());
        self.write_log.lock().push(StoreWrite {
            key,
            value: None,
            timestamp: 0,
        });
        Ok(())
    }

    fn range(&self, from: &[u8], to: &[u8]) -> Vec<(Bytes, Bytes)> {
        self.data
            .lock()
            .range(from.to_vec()..to.to_vec())
            .map(|(k, v)| (Bytes::copy_from_slice(k), v.clone()))
            .collect()
    }
}

struct MockState<K, V> {
    record_context: RecordContext,
    stream_time: i64,
    system_time: i64,
    task_id: TaskId,
    node_name: String,
    app_configs: AppConfigs,
    forwarded: Vec<ForwardedRecord<K, V>>,
    stores: HashMap<String, Arc<InMemoryRemoteStore>>,
    known_children: Option<HashSet<String>>,
}

struct MockTick {
    callback: TickCallback,
    cancelled: Arc<AtomicBool>,
}

struct MockCancellable {
    cancelled: Arc<AtomicBool>,
}

impl Cancellable for MockCancellable {
    fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Scriptable mock of the host driver context.
///
/// The mock itself is a handle: [`MockDriverContext::context`] produces the
/// object handed to the processor, and the handle keeps observing (and
/// steering) the shared state afterwards.
pub struct MockDriverContext<K, V> {
    state: Arc<Mutex<MockState<K, V>>>,
    ticks: Arc<Mutex<Vec<MockTick>>>,
}

impl<K, V> Default for MockDriverContext<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> MockDriverContext<K, V> {
    /// Creates a mock with partition 0, empty context, and no stores.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                record_context: RecordContext::default(),
                stream_time: 0,
                system_time: 0,
                task_id: TaskId {
                    subtopology: 0,
                    partition: 0,
                },
                node_name: "async-node".to_string(),
                app_configs: AppConfigs::new(),
                forwarded: Vec::new(),
                stores: HashMap::new(),
                known_children: None,
            })),
            ticks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The context object to hand to `AsyncProcessor::init`.
    #[must_use]
    pub fn context(&self) -> MockContext<K, V> {
        MockContext {
            state: Arc::clone(&self.state),
            ticks: Arc::clone(&self.ticks),
        }
    }

    /// Connects an in-memory store under `name`.
    pub fn add_store(&self, name: &str) -> Arc<InMemoryRemoteStore> {
        let store = Arc::new(InMemoryRemoteStore::new());
        self.state
            .lock()
            .stores
            .insert(name.to_string(), Arc::clone(&store));
        store
    }

    /// The store connected under `name`, if any.
    #[must_use]
    pub fn store(&self, name: &str) -> Option<Arc<InMemoryRemoteStore>> {
        self.state.lock().stores.get(name).cloned()
    }

    /// Restricts which child names forwards may target; unknown children
    /// are rejected with [`HostError::UnknownChild`].
    pub fn set_known_children(&self, children: impl IntoIterator<Item = String>) {
        self.state.lock().known_children = Some(children.into_iter().collect());
    }

    /// Replaces the host's current record context.
    pub fn set_record_context(&self, context: RecordContext) {
        self.state.lock().record_context = context;
    }

    /// The host's current record context.
    #[must_use]
    pub fn record_context(&self) -> RecordContext {
        self.state.lock().record_context.clone()
    }

    /// Sets the live stream time.
    pub fn set_stream_time(&self, time_ms: i64) {
        self.state.lock().stream_time = time_ms;
    }

    /// Sets the live system time.
    pub fn set_system_time(&self, time_ms: i64) {
        self.state.lock().system_time = time_ms;
    }

    /// Sets the task identity.
    pub fn set_task_id(&self, task_id: TaskId) {
        self.state.lock().task_id = task_id;
    }

    /// Sets the processor node name.
    pub fn set_node_name(&self, name: &str) {
        self.state.lock().node_name = name.to_string();
    }

    /// Edits the application configuration in place.
    pub fn update_configs(&self, edit: impl FnOnce(&mut AppConfigs)) {
        edit(&mut self.state.lock().app_configs);
    }

    /// Every forward executed against the host so far, in order.
    #[must_use]
    pub fn forwarded(&self) -> Vec<ForwardedRecord<K, V>>
    where
        K: Clone,
        V: Clone,
    {
        self.state.lock().forwarded.clone()
    }

    /// Fires every registered, not-yet-cancelled tick once.
    pub fn fire_tick(&self) {
        let now = self.state.lock().system_time;
        let mut ticks = self.ticks.lock();
        for tick in ticks.iter_mut() {
            if !tick.cancelled.load(Ordering::Acquire) {
                (tick.callback)(now);
            }
        }
    }

    /// Number of registered ticks that have not been cancelled.
    #[must_use]
    pub fn active_tick_count(&self) -> usize {
        self.ticks
            .lock()
            .iter()
            .filter(|t| !t.cancelled.load(Ordering::Acquire))
            .count()
    }
}

/// The [`DriverContext`] implementation produced by [`MockDriverContext`].
pub struct MockContext<K, V> {
    state: Arc<Mutex<MockState<K, V>>>,
    ticks: Arc<Mutex<Vec<MockTick>>>,
}

impl<K, V> DriverContext<K, V> for MockContext<K, V>
where
    K: Send,
    V: Send,
{
    fn forward(&mut self, record: Record<K, V>, child: Option<&str>) -> Result<(), HostError> {
        let mut state = self.state.lock();
        if let (Some(children), Some(child)) = (&state.known_children, child) {
            if !children.contains(child) {
                return Err(HostError::UnknownChild {
                    child: child.to_string(),
                });
            }
        }
        let context = state.record_context.clone();
        state.forwarded.push(ForwardedRecord {
            record,
            child: child.map(str::to_string),
            context,
        });
        Ok(())
    }

    fn schedule(&mut self, _interval: Duration, callback: TickCallback) -> Box<dyn Cancellable> {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.ticks.lock().push(MockTick {
            callback,
            cancelled: Arc::clone(&cancelled),
        });
        Box::new(MockCancellable { cancelled })
    }

    fn record_context(&self) -> RecordContext {
        self.state.lock().record_context.clone()
    }

    fn set_record_context(&mut self, context: RecordContext) {
        self.state.lock().record_context = context;
    }

    fn current_stream_time_ms(&self) -> i64 {
        self.state.lock().stream_time
    }

    fn current_system_time_ms(&self) -> i64 {
        self.state.lock().system_time
    }

    fn task_id(&self) -> TaskId {
        self.state.lock().task_id
    }

    fn current_node_name(&self) -> String {
        self.state.lock().node_name.clone()
    }

    fn get_state_store(&mut self, name: &str) -> Option<Arc<dyn RemoteKeyValueStore>> {
        self.state
            .lock()
            .stores
            .get(name)
            .cloned()
            .map(|store| store as Arc<dyn RemoteKeyValueStore>)
    }

    fn app_configs(&self) -> AppConfigs {
        self.state.lock().app_configs.clone()
    }
}
