//! # Async State Stores
//!
//! Store plumbing for async processors:
//!
//! - [`RemoteKeyValueStore`]: the backing store contract implemented by the
//!   host's state layer. Thread-safe, because worker threads read through it
//!   while the driver writes through it.
//! - [`AsyncKeyValueStore`]: the wrapper handed to user code. Reads go
//!   straight to the backing store; writes issued during user processing are
//!   intercepted onto the current event and replayed by the driver at
//!   finalization.
//! - [`AsyncStoreBuilder`]: declaration of a store connected to an async
//!   processor, carrying the flush listeners that bind the host's commit
//!   path to the processor's flush barrier.
//!
//! No read-your-write guarantee exists inside a single callback: a `get`
//! after an intercepted `put` observes only finalized state. Per-key
//! ordering is what serializes same-key readers against earlier writers.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::context::AsyncProcessorContext;
use crate::event::{DelayedWrite, EventError};

/// Errors raised by the store layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A finalization write targeted a store that was never opened by this
    /// processor.
    #[error("store {name} was not opened by this processor")]
    UnknownStore {
        /// The store name.
        name: String,
    },

    /// The backing store reported a failure.
    #[error("backing store failure: {0}")]
    Backend(String),

    /// The store wrapper outlived its processor instance.
    #[error("store used after its processor was closed")]
    Detached,

    /// A declared store is of a kind the async layer does not support.
    #[error("store {name} has unsupported kind {kind:?} (only key-value stores are supported)")]
    UnsupportedKind {
        /// The store name.
        name: String,
        /// The declared kind.
        kind: StoreKind,
    },

    /// Interception onto the current event failed.
    #[error("write interception failed: {0}")]
    Interception(#[from] EventError),
}

/// Kind of a declared state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Point-lookup key-value store. The only kind the async layer wraps.
    KeyValue,
    /// Windowed store; not supported behind the async layer.
    Windowed,
    /// Session store; not supported behind the async layer.
    Session,
}

/// A store declared by a user processor supplier.
#[derive(Debug, Clone)]
pub struct StoreDescriptor {
    /// Store name, matched against `get_state_store` calls during `init`.
    pub name: String,
    /// Store kind.
    pub kind: StoreKind,
}

impl StoreDescriptor {
    /// Declares a key-value store.
    #[must_use]
    pub fn key_value(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StoreKind::KeyValue,
        }
    }
}

/// The backing key-value store contract, implemented by the host state
/// layer.
///
/// Implementations are shared between the driver and worker threads: reads
/// may arrive from any worker while the driver is the only writer (all
/// writes funnel through finalization).
pub trait RemoteKeyValueStore: Send + Sync {
    /// Point lookup. Reflects only finalized state.
    fn get(&self, key: &[u8]) -> Option<Bytes>;

    /// Writes a key-value pair with the given timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on a storage failure.
    fn put(&self, key: Bytes, value: Bytes, timestamp: i64) -> Result<(), StoreError>;

    /// Deletes a key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on a storage failure.
    fn delete(&self, key: Bytes) -> Result<(), StoreError>;

    /// Range scan over `[from, to)` in lexicographic key order.
    fn range(&self, from: &[u8], to: &[u8]) -> Vec<(Bytes, Bytes)>;
}

/// The store handle user code sees.
///
/// Opened through the processor context during `init`; `put`/`delete`
/// issued from a worker during processing become pending writes on the
/// current event instead of touching the backing store.
pub struct AsyncKeyValueStore<K, V> {
    name: String,
    backing: Arc<dyn RemoteKeyValueStore>,
    router: Weak<AsyncProcessorContext<K, V>>,
}

impl<K, V> std::fmt::Debug for AsyncKeyValueStore<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncKeyValueStore")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<K, V> AsyncKeyValueStore<K, V>
where
    K: Clone + Eq + std::hash::Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub(crate) fn new(
        name: String,
        backing: Arc<dyn RemoteKeyValueStore>,
        router: Weak<AsyncProcessorContext<K, V>>,
    ) -> Self {
        Self {
            name,
            backing,
            router,
        }
    }

    /// Name of this store.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Direct access to the backing store; finalization writes through
    /// this.
    pub(crate) fn backing(&self) -> &Arc<dyn RemoteKeyValueStore> {
        &self.backing
    }

    /// Point lookup against the backing store.
    ///
    /// Reads are never intercepted: a worker-side `get` observes finalized
    /// state only, not writes queued earlier in the same callback.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.backing.get(key)
    }

    /// Range scan against the backing store over `[from, to)`.
    #[must_use]
    pub fn range(&self, from: &[u8], to: &[u8]) -> Vec<(Bytes, Bytes)> {
        self.backing.range(from, to)
    }

    /// Writes a key-value pair.
    ///
    /// From a worker callback this queues the write onto the current event
    /// ("write queued" is the only observable result); from the driver
    /// (`init`/`close`) it writes through immediately.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Detached`] if the processor is gone, or a
    /// backing-store error on a direct write.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.write(key, Some(Bytes::copy_from_slice(value)))
    }

    /// Deletes a key (a tombstone write).
    ///
    /// # Errors
    ///
    /// Same as [`Self::put`].
    pub fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.write(key, None)
    }

    fn write(&self, key: &[u8], value: Option<Bytes>) -> Result<(), StoreError> {
        let router = self.router.upgrade().ok_or(StoreError::Detached)?;
        let key = Bytes::copy_from_slice(key);

        if let Some(event) = router.current_worker_event() {
            event.append_write(DelayedWrite {
                store_name: self.name.clone(),
                key,
                value,
                timestamp: event.record_context().timestamp,
            })?;
            return Ok(());
        }

        // Driver side (init/close): no interception, write through.
        let timestamp = router.driver_record_timestamp();
        match value {
            Some(value) => self.backing.put(key, value, timestamp),
            None => self.backing.delete(key),
        }
    }
}

/// A flush hook bound to one processor instance; invoking it must drain the
/// processor's whole pipeline before returning.
pub type FlushListener = Box<dyn Fn() -> crate::Result<()> + Send + Sync>;

/// Builder/declaration for a store connected to an async processor.
///
/// One builder exists per store name, shared by every processor instance
/// (one per partition) created from the same supplier. Each instance
/// registers a flush listener under its `(driver-thread-name, partition)`
/// identity on init and unregisters it on close; the host's commit path
/// triggers the listener before offsets are committed.
pub struct AsyncStoreBuilder {
    name: String,
    listeners: Mutex<FxHashMap<(String, i32), FlushListener>>,
}

impl AsyncStoreBuilder {
    /// Wraps a declared store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnsupportedKind`] for anything but a
    /// key-value store.
    pub fn wrap(descriptor: &StoreDescriptor) -> Result<Self, StoreError> {
        if descriptor.kind != StoreKind::KeyValue {
            return Err(StoreError::UnsupportedKind {
                name: descriptor.name.clone(),
                kind: descriptor.kind,
            });
        }
        Ok(Self {
            name: descriptor.name.clone(),
            listeners: Mutex::new(FxHashMap::default()),
        })
    }

    /// Name of the declared store.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers the flush listener for one processor instance.
    pub fn register_flush_listener(&self, driver: &str, partition: i32, listener: FlushListener) {
        let replaced = self
            .listeners
            .lock()
            .insert((driver.to_string(), partition), listener);
        if replaced.is_some() {
            tracing::warn!(
                store = %self.name,
                driver,
                partition,
                "replacing an existing flush listener; previous processor instance \
                 was not closed cleanly"
            );
        }
    }

    /// Removes the flush listener for one processor instance. Idempotent.
    pub fn unregister_flush_listener(&self, driver: &str, partition: i32) {
        self.listeners
            .lock()
            .remove(&(driver.to_string(), partition));
    }

    /// Invoked by the host's commit path before offsets are committed.
    ///
    /// # Errors
    ///
    /// Propagates the processor's flush failure, which must abort the
    /// commit.
    pub fn trigger_flush(&self, driver: &str, partition: i32) -> crate::Result<()> {
        let listeners = self.listeners.lock();
        match listeners.get(&(driver.to_string(), partition)) {
            Some(listener) => listener(),
            None => {
                tracing::warn!(
                    store = %self.name,
                    driver,
                    partition,
                    "flush triggered with no registered listener"
                );
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for AsyncStoreBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncStoreBuilder")
            .field("name", &self.name)
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn only_key_value_stores_wrap() {
        assert!(AsyncStoreBuilder::wrap(&StoreDescriptor::key_value("kv")).is_ok());

        let windowed = StoreDescriptor {
            name: "w".to_string(),
            kind: StoreKind::Windowed,
        };
        assert!(matches!(
            AsyncStoreBuilder::wrap(&windowed),
            Err(StoreError::UnsupportedKind { .. })
        ));
    }

    #[test]
    fn flush_listener_lifecycle() {
        let builder = AsyncStoreBuilder::wrap(&StoreDescriptor::key_value("kv")).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        builder.register_flush_listener(
            "driver-1",
            0,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        builder.trigger_flush("driver-1", 0).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Unknown identity and unregistered identity are both no-ops.
        builder.trigger_flush("driver-1", 7).unwrap();
        builder.unregister_flush_listener("driver-1", 0);
        builder.trigger_flush("driver-1", 0).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Unregistering twice is fine.
        builder.unregister_flush_listener("driver-1", 0);
    }
}
