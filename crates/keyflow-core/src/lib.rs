//! # Keyflow Core
//!
//! An asynchronous per-key ordered processing runtime for keyed stream
//! processors. User processing logic is executed on a worker pool while the
//! driver thread keeps exclusive ownership of all host-facing side effects,
//! preserving, per input key, the exact ordering and at-most-one-in-flight
//! semantics that inline execution would have provided.
//!
//! This crate provides:
//! - **Events**: lifecycle tokens carrying one record and its intercepted
//!   side effects through the pipeline
//! - **Queues**: the driver-owned scheduling queue and the worker→driver
//!   finalizing queue
//! - **Worker pool**: fixed OS-thread pool shared by every processor of one
//!   driver thread, with a session-scoped registry
//! - **Context router**: per-thread dispatch that lets user code run on a
//!   worker while observing the driver's context
//! - **Processor**: the driver-side coordinator and the supplier the host
//!   topology consumes
//!
//! ## Guarantees
//!
//! 1. Per key, events reach `DONE` in offer order; nothing is promised
//!    across keys
//! 2. Within one event, forwards and writes replay in submission order,
//!    under the record context captured at offer time
//! 3. `flush_and_await` returns only once every offered event is `DONE`,
//!    making offset commits safe
//! 4. User code never observes internal queueing or threading errors;
//!    those fail the processor instance
//!
//! ## Example
//!
//! ```rust,ignore
//! use keyflow_core::{AsyncProcessorSupplier, StoreDescriptor};
//!
//! let supplier = AsyncProcessorSupplier::new(
//!     || Arc::new(MyProcessor::default()) as Arc<dyn KeyedProcessor<_, _>>,
//!     &[StoreDescriptor::key_value("counts")],
//! )?;
//!
//! // The host creates one processor per task and drives it:
//! let mut processor = supplier.get();
//! processor.init(host_context)?;
//! processor.process(record)?;
//! processor.flush_and_await()?; // pre-commit barrier
//! processor.close()?;
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod context;
pub mod event;
pub mod host;
pub mod pool;
pub mod processor;
pub mod queues;
pub mod store;
pub mod testing;

// Re-export the types a host integration touches most.
pub use config::AsyncConfig;
pub use context::AsyncProcessorContext;
pub use host::{AppConfigs, DriverContext, Record, RecordContext, TaskId};
pub use pool::PoolRegistry;
pub use processor::{AsyncProcessor, AsyncProcessorSupplier, KeyedProcessor, ProcessorId};
pub use store::{AsyncKeyValueStore, RemoteKeyValueStore, StoreDescriptor};

/// Result type for keyflow-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type aggregating every module's failure modes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Event lifecycle errors.
    #[error("event error: {0}")]
    Event(#[from] event::EventError),

    /// Pipeline queue errors.
    #[error("queue error: {0}")]
    Queue(#[from] queues::QueueError),

    /// Worker pool errors.
    #[error("pool error: {0}")]
    Pool(#[from] pool::PoolError),

    /// Context routing errors.
    #[error("context error: {0}")]
    Context(#[from] context::ContextError),

    /// Store layer errors.
    #[error("store error: {0}")]
    Store(#[from] store::StoreError),

    /// Processor coordinator errors.
    #[error("processor error: {0}")]
    Processor(#[from] processor::ProcessorError),

    /// Host context errors.
    #[error("host error: {0}")]
    Host(#[from] host::HostError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
}
