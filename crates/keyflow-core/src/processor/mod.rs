//! # Async Processor
//!
//! The driver-thread coordinator of the three-stage pipeline, and the
//! supplier that wraps a user processor factory for the host topology.
//!
//! ## Pipeline
//!
//! ```text
//!            offer                      drain-schedule
//! process() ──────> SchedulingQueue ──────────────────> WorkerPool
//!     │                   ▲                                  │
//!     │ backpressure      │ unblock_key                      │ submit
//!     ▼                   │                                  ▼
//!  (blocks)          finalization <──────────────── FinalizingQueue
//!                    (driver thread,   drain-finalize
//!                     original record context restored)
//! ```
//!
//! The coordinator is single-threaded by construction: the host invokes
//! `init`, `process`, the periodic tick, the flush listener, and `close`
//! on the driver thread only. The pipeline state still sits behind a mutex
//! because the tick and the flush listener need their own handles to it;
//! the lock is uncontended in normal operation.
//!
//! ## Ordering and the commit barrier
//!
//! Events of one key reach `DONE` in offer order; nothing is promised
//! across keys. [`AsyncProcessor::flush_and_await`] returns only when every
//! offered event is `DONE`, which is what lets the host commit offsets: at
//! that point every intercepted forward and store write has been executed
//! on the driver.

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::config::{load_pool_registry, AsyncConfig};
use crate::context::AsyncProcessorContext;
use crate::event::{AsyncEvent, EventState};
use crate::host::{Cancellable, DriverContext, Record};
use crate::pool::{self, WorkerPool};
use crate::queues::{FinalizingQueue, SchedulingQueue};
use crate::store::{AsyncStoreBuilder, StoreDescriptor};

/// Granularity of blocking waits on the finalizing queue; each slice that
/// expires without progress just re-arms the wait.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Identity of one physical processor instance: logical processor name
/// plus the partition its task owns.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessorId {
    /// Logical processor (node) name.
    pub name: String,
    /// Partition of the owning task.
    pub partition: i32,
}

impl ProcessorId {
    /// Creates a processor id.
    pub fn new(name: impl Into<String>, partition: i32) -> Self {
        Self {
            name: name.into(),
            partition,
        }
    }
}

impl fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.partition)
    }
}

/// Errors raised by the processor coordinator.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// `init` was called on an already-initialized processor.
    #[error("processor {processor} initialized twice")]
    AlreadyInitialized {
        /// The processor identity.
        processor: ProcessorId,
    },

    /// A lifecycle call arrived before `init`.
    #[error("processor is not initialized")]
    NotInitialized,

    /// Asynchrony is enabled but no pool is registered for this driver.
    #[error("no worker pool registered for driver thread {driver}")]
    MissingPool {
        /// The driver thread's name.
        driver: String,
    },

    /// The stores the user opened during `init` do not match the stores
    /// declared to the supplier.
    #[error("connected stores {declared:?} do not match stores opened during init {opened:?}; \
             every store used by the processor must be declared to the supplier and opened \
             in init")]
    StoreSetMismatch {
        /// Store names declared to the supplier.
        declared: Vec<String>,
        /// Store names actually opened during `init`.
        opened: Vec<String>,
    },

    /// A user callback failed on a worker; surfaced when the event reached
    /// the driver for finalization.
    #[error("user callback failed for event {event_id}: {message}")]
    UserCallback {
        /// Id of the failed event.
        event_id: u64,
        /// Captured panic or error message.
        message: String,
    },

    /// The processor previously failed and refuses further records.
    #[error("processor already failed: {message}")]
    Failed {
        /// The original failure message.
        message: String,
    },

    /// A blocking wait for finalizable events can never complete; the
    /// pre-commit contract is broken.
    #[error("interrupted while awaiting in-flight events")]
    FlushInterrupted,
}

/// The user's processing logic, invoked through the async layer.
///
/// A single instance is shared by the driver (for `init`/`close`) and by
/// every worker that picks up one of its records, so implementations must
/// be `Send + Sync`; per-key state belongs in state stores, not fields.
pub trait KeyedProcessor<K, V>: Send + Sync {
    /// Called once on the driver thread before any record is processed.
    /// This is the only place state stores may be opened.
    ///
    /// # Errors
    ///
    /// A failed `init` aborts the processor instance.
    fn init(&self, ctx: &Arc<AsyncProcessorContext<K, V>>) -> crate::Result<()>;

    /// Processes one record. Runs on a worker thread (or inline on the
    /// driver when asynchrony is disabled); may block on I/O. A panic here
    /// fails the processor instance, never the worker.
    fn process(&self, record: Record<K, V>);

    /// Called once on the driver thread at end of life.
    fn close(&self) {}
}

/// Pipeline state shared between the processor facade, the periodic tick,
/// and the flush listener. All three run on the driver thread.
struct Pipeline<K, V> {
    processor_id: ProcessorId,
    router: Arc<AsyncProcessorContext<K, V>>,
    scheduling: SchedulingQueue<K, V>,
    finalizing: FinalizingQueue<K, V>,
    pending: FxHashMap<u64, Arc<AsyncEvent<K, V>>>,
    pool: Option<Arc<WorkerPool>>,
    failure: Option<String>,
}

impl<K, V> Pipeline<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Admits one new event: backpressure on its key, then offer and a
    /// single non-blocking drain pass.
    fn offer(&mut self, event: Arc<AsyncEvent<K, V>>) -> crate::Result<()> {
        self.check_failed()?;

        if self.pending.contains_key(&event.id()) {
            return Err(crate::queues::QueueError::DuplicateEvent {
                event_id: event.id(),
            }
            .into());
        }
        self.pending.insert(event.id(), Arc::clone(&event));

        let key = event.key().clone();
        if self.scheduling.key_queue_is_full(&key) {
            self.back_off_for_key(&key)?;
        }

        self.scheduling.offer(event)?;
        self.execute_available_events()
    }

    /// Blocks admission until `key` drops below its cap, by scheduling
    /// whatever is processable and finalizing at least one event per
    /// round. The finalized event need not carry this key: finishing any
    /// event may unblock other keys worth scheduling.
    fn back_off_for_key(&mut self, key: &K) -> crate::Result<()> {
        while self.scheduling.key_queue_is_full(key) {
            self.drain_scheduling_queue()?;
            if self.scheduling.key_queue_is_full(key) {
                self.finalize_at_least_one()?;
            }
        }
        Ok(())
    }

    /// One non-blocking pass over both queues. Finalizing first may
    /// unblock keys; scheduling then dispatches everything processable in
    /// one batch.
    fn execute_available_events(&mut self) -> crate::Result<()> {
        let finalized = self.drain_finalizing_queue()?;
        tracing::trace!(processor = %self.processor_id, finalized, "drained finalizing queue");

        let scheduled = self.drain_scheduling_queue()?;
        tracing::trace!(processor = %self.processor_id, scheduled, "drained scheduling queue");
        Ok(())
    }

    /// Polls every currently processable event and hands the batch to the
    /// pool (or runs it inline when asynchrony is disabled). Returns the
    /// number scheduled.
    fn drain_scheduling_queue(&mut self) -> crate::Result<usize> {
        if self.failure.is_some() {
            return Ok(0);
        }

        let mut batch = Vec::new();
        while let Some(event) = self.scheduling.poll() {
            event.transition(EventState::ToProcess)?;
            batch.push(event);
        }
        let scheduled = batch.len();
        if scheduled == 0 {
            return Ok(0);
        }

        match self.pool.clone() {
            Some(worker_pool) => {
                worker_pool.schedule_for_processing(
                    &self.processor_id,
                    batch,
                    &self.finalizing.sink(),
                    &self.router,
                )?;
            }
            None => {
                // Asynchrony disabled: run on the driver, then finalize
                // immediately so the semantics match the pooled path.
                let sink = self.finalizing.sink();
                let router = Arc::clone(&self.router);
                for event in batch {
                    pool::run_event(event, &sink, &router);
                }
                self.drain_finalizing_queue()?;
            }
        }
        Ok(scheduled)
    }

    /// Completes every event already waiting in the finalizing queue.
    /// Returns the number finalized.
    fn drain_finalizing_queue(&mut self) -> crate::Result<usize> {
        let mut count = 0;
        while let Some(event) = self.finalizing.try_next() {
            self.complete_pending_event(&event)?;
            count += 1;
        }
        Ok(count)
    }

    /// Drains non-blocking; if nothing was ready, blocks until the next
    /// event arrives and completes it.
    fn finalize_at_least_one(&mut self) -> crate::Result<usize> {
        let drained = self.drain_finalizing_queue()?;
        if drained > 0 {
            return Ok(drained);
        }

        loop {
            match self.finalizing.wait_next(WAIT_SLICE)? {
                Some(event) => {
                    self.complete_pending_event(&event)?;
                    return Ok(1);
                }
                None => {
                    // Nothing arrived in this slice. If the pool died under
                    // us nothing ever will.
                    if self.pool.as_ref().is_some_and(|p| p.is_shut_down())
                        && self.finalizing.is_empty()
                    {
                        tracing::error!(
                            processor = %self.processor_id,
                            "worker pool shut down with events still in flight"
                        );
                        return Err(ProcessorError::FlushInterrupted.into());
                    }
                }
            }
        }
    }

    /// Finalizes one event: restore its captured record context, replay
    /// its forwards and writes in submission order, mark it done, unblock
    /// its key.
    fn complete_pending_event(&mut self, event: &Arc<AsyncEvent<K, V>>) -> crate::Result<()> {
        if let Some(message) = event.failure() {
            tracing::error!(
                processor = %self.processor_id,
                event_id = event.id(),
                %message,
                "user callback failed; failing processor"
            );
            self.failure = Some(message.clone());
            return Err(ProcessorError::UserCallback {
                event_id: event.id(),
                message,
            }
            .into());
        }

        self.router.prepare_finalize(event);
        event.transition(EventState::Finalizing)?;

        loop {
            let forward = event.next_forward()?;
            let write = event.next_write()?;
            if forward.is_none() && write.is_none() {
                break;
            }
            if let Some(forward) = forward {
                self.router.execute_forward(forward)?;
            }
            if let Some(write) = write {
                self.router.execute_write(write)?;
            }
        }

        event.transition(EventState::Done)?;
        self.pending.remove(&event.id());
        self.scheduling.unblock_key(event.key())?;
        tracing::trace!(
            processor = %self.processor_id,
            event_id = event.id(),
            "event finalized"
        );
        Ok(())
    }

    /// Blocks until every offered event is `DONE`. The pre-commit barrier.
    fn flush_and_await(&mut self) -> crate::Result<()> {
        // Free up anything already processed before draining the
        // scheduling queue.
        self.drain_finalizing_queue()?;

        while !self.pending.is_empty() {
            self.check_failed()?;
            let scheduled = self.drain_scheduling_queue()?;
            let finalized = self.finalize_at_least_one()?;
            tracing::debug!(
                processor = %self.processor_id,
                scheduled,
                finalized,
                remaining = self.pending.len(),
                "flush pass"
            );
        }
        Ok(())
    }

    fn check_failed(&self) -> crate::Result<()> {
        match &self.failure {
            Some(message) => Err(ProcessorError::Failed {
                message: message.clone(),
            }
            .into()),
            None => Ok(()),
        }
    }

    fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// State that only exists between `init` and `close`.
struct Initialized<K, V> {
    pipeline: Arc<Mutex<Pipeline<K, V>>>,
    router: Arc<AsyncProcessorContext<K, V>>,
    driver_name: String,
    processor_id: ProcessorId,
    tick: Box<dyn Cancellable>,
    pool: Option<Arc<WorkerPool>>,
}

/// The async processor handed to the host topology in place of the user's
/// processor.
///
/// Owned and driven by a single driver thread; see the module docs for the
/// lifecycle.
pub struct AsyncProcessor<K, V> {
    user: Arc<dyn KeyedProcessor<K, V>>,
    connected_builders: Vec<Arc<AsyncStoreBuilder>>,
    inner: Option<Initialized<K, V>>,
}

impl<K, V> AsyncProcessor<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Wraps a user processor and the builders for its declared stores.
    #[must_use]
    pub fn new(
        user: Arc<dyn KeyedProcessor<K, V>>,
        connected_builders: Vec<Arc<AsyncStoreBuilder>>,
    ) -> Self {
        Self {
            user,
            connected_builders,
            inner: None,
        }
    }

    /// Initializes the processor on the driver thread.
    ///
    /// Sets up the pipeline, registers the periodic drain tick, runs the
    /// user's `init`, verifies the opened stores against the declared set,
    /// and registers the flush listeners that bind the host's commit path
    /// to [`Self::flush_and_await`].
    ///
    /// # Errors
    ///
    /// Fails on double init, on a missing worker pool when asynchrony is
    /// enabled, on configuration errors, on a failed user `init`, and on a
    /// store-set mismatch.
    pub fn init(&mut self, host: Box<dyn DriverContext<K, V>>) -> crate::Result<()> {
        let task_id = host.task_id();
        let node_name = host.current_node_name();
        let processor_id = ProcessorId::new(node_name, task_id.partition);

        if self.inner.is_some() {
            return Err(ProcessorError::AlreadyInitialized {
                processor: processor_id,
            }
            .into());
        }

        let driver_name = thread::current()
            .name()
            .unwrap_or("unnamed-driver")
            .to_string();

        let configs = host.app_configs();
        let config = AsyncConfig::from_app_configs(&configs)?;

        let worker_pool = if config.async_enabled() {
            let registry = load_pool_registry(&configs)?;
            let found =
                registry
                    .pool_for_driver(&driver_name)
                    .ok_or_else(|| ProcessorError::MissingPool {
                        driver: driver_name.clone(),
                    })?;
            Some(found)
        } else {
            None
        };

        let router = AsyncProcessorContext::new(host);
        let pipeline = Arc::new(Mutex::new(Pipeline {
            processor_id: processor_id.clone(),
            router: Arc::clone(&router),
            scheduling: SchedulingQueue::new(config.max_events_per_key),
            finalizing: FinalizingQueue::new(),
            pending: FxHashMap::default(),
            pool: worker_pool.clone(),
            failure: None,
        }));

        // The tick bounds finalization latency while no records arrive.
        let mut tick = {
            let pipeline = Arc::clone(&pipeline);
            let tick_processor = processor_id.clone();
            router.schedule_tick(
                config.flush_interval,
                Box::new(move |_now| {
                    if let Err(error) = pipeline.lock().execute_available_events() {
                        tracing::error!(
                            processor = %tick_processor,
                            %error,
                            "drain tick failed"
                        );
                    }
                }),
            )
        };

        if let Some(worker_pool) = &worker_pool {
            worker_pool.register_processor(&processor_id);
        }

        let setup = self
            .user
            .init(&router)
            .and_then(|()| self.verify_connected_stores(&router));
        if let Err(error) = setup {
            tick.cancel();
            if let Some(worker_pool) = &worker_pool {
                worker_pool.remove_processor(&processor_id);
            }
            return Err(error);
        }

        for builder in &self.connected_builders {
            let pipeline = Arc::clone(&pipeline);
            builder.register_flush_listener(
                &driver_name,
                processor_id.partition,
                Box::new(move || pipeline.lock().flush_and_await()),
            );
        }

        router.enable_processing_mode();

        tracing::debug!(
            processor = %processor_id,
            driver = %driver_name,
            pool_size = config.pool_size,
            max_events_per_key = config.max_events_per_key,
            "async processor initialized"
        );

        self.inner = Some(Initialized {
            pipeline,
            router,
            driver_name,
            processor_id,
            tick,
            pool: worker_pool,
        });
        Ok(())
    }

    /// Offers one input record to the pipeline.
    ///
    /// May block in the backpressure loop when the record's key is at its
    /// admission cap; that is the flow-control mechanism.
    ///
    /// # Errors
    ///
    /// Fails before `init`, after a surfaced user-callback failure, and on
    /// any fatal pipeline error.
    pub fn process(&mut self, record: Record<K, V>) -> crate::Result<()> {
        let inner = self.inner.as_ref().ok_or(ProcessorError::NotInitialized)?;

        let (record_context, stream_time, system_time) = inner.router.offer_snapshot();
        let user = Arc::clone(&self.user);
        let callback_record = record.clone();
        let event = AsyncEvent::new(
            record,
            inner.processor_id.partition,
            record_context,
            stream_time,
            system_time,
            Box::new(move || user.process(callback_record)),
        );

        inner.pipeline.lock().offer(event)
    }

    /// Blocks until every offered event is `DONE` and all intercepted side
    /// effects have been executed. Called by the host before committing
    /// offsets, and by the store flush hook.
    ///
    /// A processor that was never initialized has nothing pending.
    ///
    /// # Errors
    ///
    /// Propagates user-callback failures and fatal pipeline errors; the
    /// host must not commit if this fails.
    pub fn flush_and_await(&self) -> crate::Result<()> {
        match &self.inner {
            Some(inner) => inner.pipeline.lock().flush_and_await(),
            None => Ok(()),
        }
    }

    /// Closes the processor without waiting for in-flight events.
    ///
    /// The host is responsible for calling [`Self::flush_and_await`] first
    /// on a clean shutdown; closing with events still pending is logged as
    /// a warning and the events are abandoned (safe: none of their side
    /// effects have been applied).
    ///
    /// # Errors
    ///
    /// Fails if the processor was never initialized.
    pub fn close(&mut self) -> crate::Result<()> {
        let mut inner = self.inner.take().ok_or(ProcessorError::NotInitialized)?;

        let pending = inner.pipeline.lock().pending_count();
        if pending > 0 {
            tracing::warn!(
                processor = %inner.processor_id,
                pending,
                "closing async processor with in-flight events; this is expected \
                 only when the task shut down dirty without a prior flush"
            );
        }

        inner.tick.cancel();
        if let Some(worker_pool) = &inner.pool {
            worker_pool.remove_processor(&inner.processor_id);
        }
        for builder in &self.connected_builders {
            builder.unregister_flush_listener(&inner.driver_name, inner.processor_id.partition);
        }

        self.user.close();
        Ok(())
    }

    /// Number of events offered but not yet `DONE`.
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(0, |inner| inner.pipeline.lock().pending_count())
    }

    fn verify_connected_stores(
        &self,
        router: &Arc<AsyncProcessorContext<K, V>>,
    ) -> crate::Result<()> {
        let declared: HashSet<String> = self
            .connected_builders
            .iter()
            .map(|b| b.name().to_string())
            .collect();
        let opened: HashSet<String> = router.opened_store_names().into_iter().collect();

        if declared != opened {
            let mut declared: Vec<String> = declared.into_iter().collect();
            let mut opened: Vec<String> = opened.into_iter().collect();
            declared.sort();
            opened.sort();
            tracing::error!(
                ?declared,
                ?opened,
                "stores opened during init do not match the declared set"
            );
            return Err(ProcessorError::StoreSetMismatch { declared, opened }.into());
        }
        Ok(())
    }
}

impl<K, V> fmt::Debug for AsyncProcessor<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncProcessor")
            .field(
                "processor_id",
                &self.inner.as_ref().map(|i| i.processor_id.clone()),
            )
            .field("initialized", &self.inner.is_some())
            .field("connected_stores", &self.connected_builders.len())
            .finish()
    }
}

/// Factory wrapping a user processor supplier for the host topology.
///
/// Construction wraps each declared store in its async-aware builder; the
/// host connects those builders to the topology and calls [`Self::get`]
/// once per task to obtain a fresh processor instance. All instances of
/// one supplier share the store builders (and through them the flush
/// listeners), exactly one per declared store name.
pub struct AsyncProcessorSupplier<K, V> {
    user_supplier: Box<dyn Fn() -> Arc<dyn KeyedProcessor<K, V>> + Send + Sync>,
    builders: Vec<Arc<AsyncStoreBuilder>>,
}

impl<K, V> AsyncProcessorSupplier<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Wraps a user processor factory and its declared stores.
    ///
    /// # Errors
    ///
    /// Fails if any declared store is not a key-value store; only those
    /// can be async-wrapped.
    pub fn new(
        user_supplier: impl Fn() -> Arc<dyn KeyedProcessor<K, V>> + Send + Sync + 'static,
        stores: &[StoreDescriptor],
    ) -> crate::Result<Self> {
        let builders = stores
            .iter()
            .map(|descriptor| AsyncStoreBuilder::wrap(descriptor).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            user_supplier: Box::new(user_supplier),
            builders,
        })
    }

    /// Creates a fresh processor instance for one task.
    #[must_use]
    pub fn get(&self) -> AsyncProcessor<K, V> {
        AsyncProcessor::new((self.user_supplier)(), self.builders.clone())
    }

    /// The async store builders the host must connect to the topology.
    #[must_use]
    pub fn stores(&self) -> &[Arc<AsyncStoreBuilder>] {
        &self.builders
    }
}

impl<K, V> fmt::Debug for AsyncProcessorSupplier<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncProcessorSupplier")
            .field(
                "stores",
                &self.builders.iter().map(|b| b.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
