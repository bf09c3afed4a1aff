//! # Host Framework Interface
//!
//! The contract between the async runtime and the stream-processing framework
//! that hosts it. The host owns the driver thread, delivers input records on
//! it, and provides the processing context that all side effects ultimately
//! flow through.
//!
//! Everything in this module is *consumed* by the runtime and *implemented*
//! by the host (or by [`crate::testing`] in tests). The runtime never spawns
//! a driver thread itself.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::store::RemoteKeyValueStore;

/// Record headers: ordered key/value pairs carried alongside a record.
pub type Headers = Vec<(String, Bytes)>;

/// A keyed record flowing through the processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<K, V> {
    /// Record key. Per-key ordering is defined over this value.
    pub key: K,
    /// Record value.
    pub value: V,
    /// Record timestamp in epoch milliseconds.
    pub timestamp: i64,
}

impl<K, V> Record<K, V> {
    /// Creates a new record.
    pub fn new(key: K, value: V, timestamp: i64) -> Self {
        Self {
            key,
            value,
            timestamp,
        }
    }
}

/// Identity of the task hosting a processor instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    /// Subtopology index within the topology.
    pub subtopology: i32,
    /// Input partition this task owns.
    pub partition: i32,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.subtopology, self.partition)
    }
}

/// Host-supplied metadata accompanying one input record.
///
/// Captured when a record is offered to the pipeline and restored onto the
/// driver context before any of that record's side effects are replayed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecordContext {
    /// Source topic, if the record originated from an input topic.
    /// Empty for records injected by upstream punctuation.
    pub topic: Option<String>,
    /// Source partition.
    pub partition: i32,
    /// Source offset.
    pub offset: i64,
    /// Record timestamp in epoch milliseconds.
    pub timestamp: i64,
    /// Record headers.
    pub headers: Headers,
}

impl RecordContext {
    /// Projects the source coordinates of this context, if the record came
    /// from an input topic.
    #[must_use]
    pub fn metadata(&self) -> Option<RecordMetadata> {
        self.topic.as_ref().map(|topic| RecordMetadata {
            topic: topic.clone(),
            partition: self.partition,
            offset: self.offset,
        })
    }
}

/// Source coordinates of an input record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    /// Source topic.
    pub topic: String,
    /// Source partition.
    pub partition: i32,
    /// Source offset.
    pub offset: i64,
}

/// Handle to a registered periodic tick; cancelling it stops future firings.
pub trait Cancellable: Send {
    /// Cancels the tick. Idempotent.
    fn cancel(&mut self);
}

/// Callback invoked by the host on each tick, with the current wall-clock
/// time in epoch milliseconds.
pub type TickCallback = Box<dyn FnMut(i64) + Send>;

/// Errors surfaced by the host context.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// A forward named a downstream child unknown to the topology.
    #[error("unknown downstream child node: {child}")]
    UnknownChild {
        /// The child name that failed to resolve.
        child: String,
    },

    /// A state store requested by name is not connected to this task.
    #[error("state store not available to this task: {name}")]
    UnknownStore {
        /// The requested store name.
        name: String,
    },

    /// Any other host-side failure executing a side effect.
    #[error("host context failure: {0}")]
    Other(String),
}

/// The driver-thread processing context supplied by the host.
///
/// All methods are invoked on the driver thread only; implementations do not
/// need to be thread-safe beyond `Send` (the runtime serializes access).
pub trait DriverContext<K, V>: Send {
    /// Forwards a record downstream, optionally to a single named child.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::UnknownChild`] if `child` does not name a
    /// downstream node, or another [`HostError`] on delivery failure.
    fn forward(&mut self, record: Record<K, V>, child: Option<&str>) -> Result<(), HostError>;

    /// Registers a wall-clock periodic tick.
    fn schedule(&mut self, interval: Duration, callback: TickCallback) -> Box<dyn Cancellable>;

    /// The metadata of the record currently being processed.
    fn record_context(&self) -> RecordContext;

    /// Replaces the current record metadata. Used to restore an event's
    /// captured context before replaying its side effects.
    fn set_record_context(&mut self, context: RecordContext);

    /// Current stream time (maximum observed record timestamp) in epoch ms.
    fn current_stream_time_ms(&self) -> i64;

    /// Current wall-clock time in epoch ms, as tracked by the host.
    fn current_system_time_ms(&self) -> i64;

    /// Identity of the task hosting this processor.
    fn task_id(&self) -> TaskId;

    /// Name of the processor node currently executing.
    fn current_node_name(&self) -> String;

    /// Opens the state store backing the given name, if connected.
    fn get_state_store(&mut self, name: &str) -> Option<Arc<dyn RemoteKeyValueStore>>;

    /// The full application configuration.
    fn app_configs(&self) -> AppConfigs;

    /// The application configuration entries under `prefix`, with the
    /// prefix stripped.
    fn app_configs_with_prefix(&self, prefix: &str) -> AppConfigs {
        self.app_configs().with_prefix(prefix)
    }
}

/// Application configuration as handed to the runtime by the host.
///
/// String entries carry ordinary settings. Shared handles carry live objects
/// that must travel through the configuration; the pool registry is the
/// only such handle the runtime itself uses.
#[derive(Clone, Default)]
pub struct AppConfigs {
    entries: HashMap<String, String>,
    handles: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl AppConfigs {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a string entry.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Stores a shared handle under `key`.
    pub fn set_handle<T: Any + Send + Sync>(
        &mut self,
        key: impl Into<String>,
        handle: Arc<T>,
    ) -> &mut Self {
        self.handles.insert(key.into(), handle);
        self
    }

    /// Looks up a string entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Looks up a shared handle and downcasts it to `T`.
    ///
    /// Returns `None` if the key is absent or holds a different type.
    #[must_use]
    pub fn handle<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.handles
            .get(key)
            .and_then(|any| Arc::clone(any).downcast::<T>().ok())
    }

    /// Returns the configuration restricted to keys under `prefix`, with
    /// the prefix stripped from each key.
    #[must_use]
    pub fn with_prefix(&self, prefix: &str) -> AppConfigs {
        let entries = self
            .entries
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(prefix)
                    .map(|stripped| (stripped.to_string(), v.clone()))
            })
            .collect();
        let handles = self
            .handles
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(prefix)
                    .map(|stripped| (stripped.to_string(), Arc::clone(v)))
            })
            .collect();
        AppConfigs { entries, handles }
    }
}

impl fmt::Debug for AppConfigs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfigs")
            .field("entries", &self.entries)
            .field("handles", &self.handles.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_context_metadata_requires_topic() {
        let ctx = RecordContext {
            topic: Some("orders".to_string()),
            partition: 3,
            offset: 42,
            timestamp: 1_000,
            headers: Vec::new(),
        };
        let meta = ctx.metadata().unwrap();
        assert_eq!(meta.topic, "orders");
        assert_eq!(meta.partition, 3);
        assert_eq!(meta.offset, 42);

        let punctuated = RecordContext::default();
        assert!(punctuated.metadata().is_none());
    }

    #[test]
    fn app_configs_prefix_strips_keys() {
        let mut configs = AppConfigs::new();
        configs.set("main.consumer.fetch.max", "100");
        configs.set("producer.linger.ms", "5");

        let consumer = configs.with_prefix("main.consumer.");
        assert_eq!(consumer.get("fetch.max"), Some("100"));
        assert!(consumer.get("producer.linger.ms").is_none());
        assert!(consumer.get("linger.ms").is_none());
    }

    #[test]
    fn app_configs_handle_roundtrip() {
        let mut configs = AppConfigs::new();
        configs.set_handle("registry", Arc::new(7_u64));

        assert_eq!(configs.handle::<u64>("registry").as_deref(), Some(&7));
        assert!(configs.handle::<u32>("registry").is_none());
        assert!(configs.handle::<u64>("missing").is_none());
    }
}
