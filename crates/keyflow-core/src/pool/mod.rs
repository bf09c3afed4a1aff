//! # Worker Pool
//!
//! A fixed set of OS threads that runs user callbacks on behalf of every
//! async processor owned by one driver thread.
//!
//! ## Architecture
//!
//! ```text
//!  driver thread                         worker threads
//! ┌──────────────┐   task channel   ┌──────────┐ ┌──────────┐
//! │ coordinator  │ ───────────────> │ worker 0 │ │ worker 1 │ ...
//! │ (drain pass) │                  └────┬─────┘ └────┬─────┘
//! └──────▲───────┘                       │            │
//!        │          finalizing queue     │            │
//!        └───────────────────────────────┴────────────┘
//! ```
//!
//! Tasks are claimed FIFO by whichever worker is idle. Each task runs one
//! event: transition to `PROCESSING`, install the worker delegate on the
//! context router for the duration of the user callback, run the callback,
//! and hand the event to the processor's finalizing sink. A panicking
//! callback is caught and recorded on the event; the worker itself never
//! dies from user code.

mod registry;

pub use registry::PoolRegistry;

use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::context::AsyncProcessorContext;
use crate::event::{AsyncEvent, EventState};
use crate::processor::ProcessorId;
use crate::queues::FinalizingSink;

/// Errors raised by the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread {name}: {message}")]
    SpawnFailed {
        /// Name of the thread that failed to spawn.
        name: String,
        /// OS error message.
        message: String,
    },

    /// Work was submitted after the pool began shutting down.
    #[error("worker pool for driver {driver} is shut down")]
    ShutDown {
        /// The owning driver thread's name.
        driver: String,
    },
}

type Task = Box<dyn FnOnce() + Send>;

/// Fixed-size worker pool dedicated to one driver thread, shared by all
/// async processors that driver runs.
pub struct WorkerPool {
    driver_name: String,
    size: usize,
    tasks: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: Arc<AtomicBool>,
    processors: Mutex<FxHashMap<ProcessorId, u64>>,
}

impl WorkerPool {
    /// Spawns a pool of `size` workers for the named driver thread.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::SpawnFailed`] if any worker thread cannot be
    /// created.
    pub fn spawn(driver_name: &str, size: usize) -> Result<Arc<Self>, PoolError> {
        let (tx, rx) = crossbeam_channel::unbounded::<Task>();
        let shutting_down = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let name = format!("{driver_name}-async-{index}");
            let rx = rx.clone();
            let shutting_down = Arc::clone(&shutting_down);
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_main(&rx, &shutting_down))
                .map_err(|e| PoolError::SpawnFailed {
                    name,
                    message: e.to_string(),
                })?;
            workers.push(handle);
        }

        tracing::debug!(driver = driver_name, size, "started async worker pool");
        Ok(Arc::new(Self {
            driver_name: driver_name.to_string(),
            size,
            tasks: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            shutting_down,
            processors: Mutex::new(FxHashMap::default()),
        }))
    }

    /// Name of the driver thread this pool serves.
    #[must_use]
    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    /// Number of worker threads.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// True once shutdown has been initiated.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Registers a processor instance with this pool.
    pub fn register_processor(&self, id: &ProcessorId) {
        let replaced = self.processors.lock().insert(id.clone(), 0);
        if replaced.is_some() {
            tracing::warn!(
                processor = %id,
                driver = %self.driver_name,
                "processor registered twice with its worker pool"
            );
        }
    }

    /// Unregisters a processor instance. Idempotent.
    pub fn remove_processor(&self, id: &ProcessorId) {
        if let Some(scheduled) = self.processors.lock().remove(id) {
            tracing::debug!(
                processor = %id,
                events_scheduled = scheduled,
                "removed processor from worker pool"
            );
        }
    }

    /// Enqueues a batch of events for processing. Tasks are claimed FIFO by
    /// idle workers; events of the same batch may run concurrently (the
    /// scheduling queue has already guaranteed they carry distinct keys).
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::ShutDown`] if the pool is no longer accepting
    /// work.
    pub fn schedule_for_processing<K, V>(
        &self,
        processor: &ProcessorId,
        events: Vec<Arc<AsyncEvent<K, V>>>,
        sink: &FinalizingSink<K, V>,
        router: &Arc<AsyncProcessorContext<K, V>>,
    ) -> Result<(), PoolError>
    where
        K: Clone + Eq + Hash + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let tasks = self.tasks.lock();
        let Some(tx) = tasks.as_ref() else {
            return Err(PoolError::ShutDown {
                driver: self.driver_name.clone(),
            });
        };

        let count = events.len() as u64;
        for event in events {
            let sink = sink.clone();
            let router = Arc::clone(router);
            let task: Task = Box::new(move || run_event(event, &sink, &router));
            tx.send(task).map_err(|_| PoolError::ShutDown {
                driver: self.driver_name.clone(),
            })?;
        }

        if let Some(scheduled) = self.processors.lock().get_mut(processor) {
            *scheduled += count;
        }
        Ok(())
    }

    /// Initiates shutdown without waiting: workers finish the task they are
    /// on, drain nothing further, and exit. Joining happens when the pool
    /// is dropped.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        // Dropping the sender wakes every blocked worker.
        self.tasks.lock().take();
        tracing::debug!(driver = %self.driver_name, "worker pool shutdown initiated");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("driver_name", &self.driver_name)
            .field("size", &self.size)
            .field("is_shut_down", &self.is_shut_down())
            .field("processors", &self.processors.lock().len())
            .finish()
    }
}

fn worker_main(rx: &Receiver<Task>, shutting_down: &AtomicBool) {
    loop {
        match rx.recv() {
            Ok(task) => task(),
            // All senders gone: the pool was shut down.
            Err(_) => break,
        }
        if shutting_down.load(Ordering::Acquire) {
            break;
        }
    }
}

/// Runs one event through the worker half of its lifecycle. Also used
/// inline on the driver when the pool is disabled (`async_pool_size = 0`).
pub(crate) fn run_event<K, V>(
    event: Arc<AsyncEvent<K, V>>,
    sink: &FinalizingSink<K, V>,
    router: &Arc<AsyncProcessorContext<K, V>>,
) where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    if let Err(e) = event.transition(EventState::Processing) {
        event.record_failure(e.to_string());
        submit(event, sink);
        return;
    }

    router.install_worker_delegate(Arc::clone(&event));
    match event.take_callback() {
        Ok(callback) => {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
                event.record_failure(panic_message(&payload));
            }
        }
        Err(e) => event.record_failure(e.to_string()),
    }
    router.remove_worker_delegate();

    if let Err(e) = event.transition(EventState::ToFinalize) {
        event.record_failure(e.to_string());
    }
    submit(event, sink);
}

fn submit<K, V>(event: Arc<AsyncEvent<K, V>>, sink: &FinalizingSink<K, V>) {
    let event_id = event.id();
    if sink.submit(event).is_err() {
        // The driver is gone; nothing can be finalized any more. Safe to
        // drop: no side effects were applied.
        tracing::error!(event_id, "dropping processed event: finalizing queue disconnected");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "user callback panicked".to_string()
    }
}
