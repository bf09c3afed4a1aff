//! End-to-end pipeline tests driving a full processor instance against the
//! mock host context.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{self, AsyncConfig};
use crate::context::AsyncProcessorContext;
use crate::host::{Record, RecordContext};
use crate::pool::PoolRegistry;
use crate::store::{AsyncKeyValueStore, AsyncStoreBuilder, RemoteKeyValueStore, StoreDescriptor};
use crate::testing::MockDriverContext;

use super::{AsyncProcessor, AsyncProcessorSupplier, KeyedProcessor, ProcessorError};

type Ctx = Arc<AsyncProcessorContext<String, String>>;
type Stores = HashMap<String, Arc<AsyncKeyValueStore<String, String>>>;
type OnProcess = Box<dyn Fn(&Ctx, &Stores, Record<String, String>) + Send + Sync>;

/// Scriptable user processor: opens the given stores in init and delegates
/// each record to the provided closure.
struct TestProcessor {
    store_names: Vec<String>,
    on_process: OnProcess,
    ctx: Mutex<Option<Ctx>>,
    stores: Mutex<Stores>,
    invocations: AtomicUsize,
}

impl TestProcessor {
    fn new(store_names: &[&str], on_process: OnProcess) -> Self {
        Self {
            store_names: store_names.iter().map(|s| (*s).to_string()).collect(),
            on_process,
            ctx: Mutex::new(None),
            stores: Mutex::new(HashMap::new()),
            invocations: AtomicUsize::new(0),
        }
    }

    fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl KeyedProcessor<String, String> for TestProcessor {
    fn init(&self, ctx: &Ctx) -> crate::Result<()> {
        let mut opened = HashMap::new();
        for name in &self.store_names {
            opened.insert(name.clone(), ctx.state_store(name)?);
        }
        *self.stores.lock() = opened;
        *self.ctx.lock() = Some(Arc::clone(ctx));
        Ok(())
    }

    fn process(&self, record: Record<String, String>) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let ctx = self.ctx.lock().clone().expect("processor initialized");
        let stores = self.stores.lock();
        (self.on_process)(&ctx, &stores, record);
    }
}

struct Harness {
    mock: MockDriverContext<String, String>,
    // Keeps the pools alive for the lifetime of the test.
    _registry: Arc<PoolRegistry>,
    processor: AsyncProcessor<String, String>,
    user: Arc<TestProcessor>,
}

fn driver_name() -> String {
    thread::current()
        .name()
        .unwrap_or("test-driver")
        .to_string()
}

fn record(key: &str, value: &str) -> Record<String, String> {
    Record::new(key.to_string(), value.to_string(), 1_000)
}

fn forward_all() -> OnProcess {
    Box::new(|ctx, _stores, rec| {
        ctx.forward(rec).unwrap();
    })
}

fn harness(config: &AsyncConfig, stores: &[&str], on_process: OnProcess) -> Harness {
    let mock = MockDriverContext::new();
    for store in stores {
        mock.add_store(store);
    }

    let registry = Arc::new(PoolRegistry::new(config.pool_size));
    if config.async_enabled() {
        registry.register_pool(&driver_name()).unwrap();
    }

    {
        let registry = Arc::clone(&registry);
        let config = config.clone();
        mock.update_configs(move |configs| {
            config::store_async_config(configs, &config);
            config::store_pool_registry(configs, registry);
        });
    }

    let user = Arc::new(TestProcessor::new(stores, on_process));
    let builders = stores
        .iter()
        .map(|name| Arc::new(AsyncStoreBuilder::wrap(&StoreDescriptor::key_value(*name)).unwrap()))
        .collect();

    let mut processor = AsyncProcessor::new(Arc::clone(&user) as _, builders);
    processor.init(Box::new(mock.context())).unwrap();

    Harness {
        mock,
        _registry: registry,
        processor,
        user,
    }
}

fn async_config(pool_size: usize, max_events_per_key: usize) -> AsyncConfig {
    AsyncConfig::builder()
        .pool_size(pool_size)
        .max_events_per_key(max_events_per_key)
        .flush_interval(Duration::from_millis(5))
        .build()
        .unwrap()
}

#[test]
fn same_key_events_finalize_in_offer_order() {
    let mut h = harness(
        &async_config(2, 1),
        &[],
        Box::new(|ctx, _stores, rec| {
            if rec.value == "slow" {
                thread::sleep(Duration::from_millis(50));
            }
            ctx.forward(rec).unwrap();
        }),
    );

    h.processor.process(record("a", "slow")).unwrap();
    h.processor.process(record("a", "second")).unwrap();
    h.processor.process(record("b", "fast")).unwrap();
    h.processor.flush_and_await().unwrap();

    let forwarded = h.mock.forwarded();
    assert_eq!(forwarded.len(), 3);
    let position = |value: &str| {
        forwarded
            .iter()
            .position(|f| f.record.value == value)
            .unwrap()
    };
    // (a, second) strictly after (a, slow); (b, fast) may land anywhere.
    assert!(position("slow") < position("second"));

    h.processor.close().unwrap();
}

#[test]
fn side_effects_replay_in_order_under_captured_context() {
    let mut h = harness(
        &async_config(2, 1),
        &["kv"],
        Box::new(|ctx, stores, rec| {
            let store = &stores["kv"];
            ctx.forward(record(&rec.key, "r1")).unwrap();
            store.put(b"x", b"5").unwrap();
            ctx.forward(record(&rec.key, "r2")).unwrap();
            store.put(b"y", b"6").unwrap();
        }),
    );

    let offer_context = RecordContext {
        topic: Some("in".to_string()),
        partition: 0,
        offset: 7,
        timestamp: 1_234,
        headers: Vec::new(),
    };
    h.mock.set_record_context(offer_context);
    h.processor.process(record("a", "v")).unwrap();

    // The host context moves on before finalization happens; the replayed
    // side effects must still see the captured context.
    h.mock.set_record_context(RecordContext {
        offset: 99,
        ..RecordContext::default()
    });
    h.processor.flush_and_await().unwrap();

    let forwarded = h.mock.forwarded();
    assert_eq!(forwarded.len(), 2);
    assert_eq!(forwarded[0].record.value, "r1");
    assert_eq!(forwarded[1].record.value, "r2");
    for f in &forwarded {
        assert_eq!(f.context.offset, 7);
        assert_eq!(f.context.topic.as_deref(), Some("in"));
    }

    let writes = h.mock.store("kv").unwrap().write_log();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].key.as_ref(), b"x");
    assert_eq!(writes[1].key.as_ref(), b"y");
    // Intercepted writes carry the captured record timestamp.
    assert_eq!(writes[0].timestamp, 1_234);

    h.processor.close().unwrap();
}

#[test]
fn per_key_admission_never_exceeds_the_cap() {
    let mut h = harness(
        &async_config(2, 3),
        &[],
        Box::new(|_ctx, _stores, _rec| {
            thread::sleep(Duration::from_millis(10));
        }),
    );

    for i in 0..10 {
        h.processor.process(record("k", &format!("v{i}"))).unwrap();
        // Admitted-but-not-done events for the single key never exceed the
        // cap; offers past it block until a predecessor reaches DONE.
        assert!(h.processor.pending_events() <= 3);
    }

    h.processor.flush_and_await().unwrap();
    assert_eq!(h.processor.pending_events(), 0);
    assert_eq!(h.user.invocations(), 10);
    h.processor.close().unwrap();
}

#[test]
fn callback_panic_fails_the_processor_and_blocks_the_key() {
    let mut h = harness(
        &async_config(1, 3),
        &[],
        Box::new(|_ctx, _stores, rec| {
            if rec.value == "boom" {
                // Keep the worker busy long enough for the second offer to
                // land before the failure surfaces.
                thread::sleep(Duration::from_millis(50));
                panic!("injected failure");
            }
        }),
    );

    h.processor.process(record("a", "boom")).unwrap();
    h.processor.process(record("a", "after")).unwrap();

    // The flush surfaces the captured panic.
    let error = h.processor.flush_and_await().unwrap_err();
    assert!(matches!(
        error,
        crate::Error::Processor(ProcessorError::UserCallback { .. })
    ));

    // The successor of the failed key was never dispatched.
    assert_eq!(h.user.invocations(), 1);
    assert!(h.processor.pending_events() >= 1);

    // Further records are refused outright.
    let refused = h.processor.process(record("b", "v")).unwrap_err();
    assert!(matches!(
        refused,
        crate::Error::Processor(ProcessorError::Failed { .. })
    ));

    // A dirty close is allowed; it warns and abandons the events.
    h.processor.close().unwrap();
}

#[test]
fn tick_drains_completed_events_while_driver_is_idle() {
    let mut h = harness(&async_config(2, 1), &[], forward_all());

    h.processor.process(record("a", "1")).unwrap();
    h.processor.process(record("b", "1")).unwrap();
    h.processor.process(record("c", "1")).unwrap();

    // Let the workers finish; the events now sit in the finalizing queue
    // because the driver has gone idle.
    thread::sleep(Duration::from_millis(100));

    h.mock.fire_tick();
    assert_eq!(h.processor.pending_events(), 0);
    assert_eq!(h.mock.forwarded().len(), 3);
    h.processor.close().unwrap();
}

#[test]
fn tick_unblocks_same_key_successors() {
    let mut h = harness(&async_config(2, 2), &[], forward_all());

    h.processor.process(record("k", "first")).unwrap();
    h.processor.process(record("k", "second")).unwrap();

    // First event completes on a worker; its successor is stuck behind it.
    thread::sleep(Duration::from_millis(100));
    h.mock.fire_tick(); // finalizes "first", schedules "second"
    thread::sleep(Duration::from_millis(100));
    h.mock.fire_tick(); // finalizes "second"

    assert_eq!(h.processor.pending_events(), 0);
    let values: Vec<_> = h
        .mock
        .forwarded()
        .into_iter()
        .map(|f| f.record.value)
        .collect();
    assert_eq!(values, vec!["first".to_string(), "second".to_string()]);
    h.processor.close().unwrap();
}

#[test]
fn flush_awaits_a_large_mixed_key_backlog() {
    let mut h = harness(
        &async_config(4, 10),
        &[],
        Box::new(|ctx, _stores, rec| {
            thread::sleep(Duration::from_millis(1));
            ctx.forward(rec).unwrap();
        }),
    );

    for i in 0..50 {
        let key = format!("key-{}", i % 5);
        h.processor.process(record(&key, &format!("v{i}"))).unwrap();
    }

    h.processor.flush_and_await().unwrap();
    assert_eq!(h.processor.pending_events(), 0);
    assert_eq!(h.mock.forwarded().len(), 50);

    // Per key, values arrive in offer order.
    for k in 0..5 {
        let key = format!("key-{k}");
        let per_key: Vec<_> = h
            .mock
            .forwarded()
            .into_iter()
            .filter(|f| f.record.key == key)
            .map(|f| f.record.value)
            .collect();
        let mut sorted = per_key.clone();
        sorted.sort_by_key(|v| v[1..].parse::<u32>().unwrap());
        assert_eq!(per_key, sorted);
    }

    h.processor.close().unwrap();
}

#[test]
fn disabled_pool_runs_synchronously_with_identical_semantics() {
    let mut h = harness(
        &async_config(0, 1),
        &["kv"],
        Box::new(|ctx, stores, rec| {
            stores["kv"].put(rec.key.as_bytes(), rec.value.as_bytes()).unwrap();
            ctx.forward(rec).unwrap();
        }),
    );

    h.processor.process(record("a", "1")).unwrap();
    // Finalization is immediate: nothing pending between records.
    assert_eq!(h.processor.pending_events(), 0);
    h.processor.process(record("b", "2")).unwrap();
    assert_eq!(h.processor.pending_events(), 0);

    let forwarded = h.mock.forwarded();
    assert_eq!(forwarded.len(), 2);
    assert_eq!(forwarded[0].record.key, "a");
    assert_eq!(forwarded[1].record.key, "b");

    let store = h.mock.store("kv").unwrap();
    assert_eq!(store.get(b"a").unwrap().as_ref(), b"1");
    assert_eq!(store.get(b"b").unwrap().as_ref(), b"2");

    h.processor.flush_and_await().unwrap();
    h.processor.close().unwrap();
}

#[test]
fn worker_reads_observe_only_finalized_state() {
    let mut h = harness(
        &async_config(2, 1),
        &["kv"],
        Box::new(|_ctx, stores, rec| {
            let store = &stores["kv"];
            let seen = store.get(b"slot").map(|b| b.as_ref().to_vec());
            match rec.value.as_str() {
                "first" => {
                    // No read-your-write: nothing is visible yet, including
                    // this event's own queued write.
                    assert!(seen.is_none());
                    store.put(b"slot", b"first").unwrap();
                    assert!(store.get(b"slot").is_none());
                }
                _ => {
                    // The same-key predecessor finalized before this event
                    // became processable, so its write is visible.
                    assert_eq!(seen.as_deref(), Some(b"first".as_ref()));
                }
            }
        }),
    );

    h.processor.process(record("k", "first")).unwrap();
    h.processor.process(record("k", "second")).unwrap();
    h.processor.flush_and_await().unwrap();
    assert_eq!(h.user.invocations(), 2);
    h.processor.close().unwrap();
}

#[test]
fn worker_context_serves_offer_time_snapshots() {
    let mut h = harness(
        &async_config(2, 1),
        &[],
        Box::new(|ctx, _stores, _rec| {
            assert_eq!(ctx.current_stream_time_ms(), 500);
            assert_eq!(ctx.current_system_time_ms(), 900);
            assert_eq!(ctx.offset(), 41);
        }),
    );

    h.mock.set_stream_time(500);
    h.mock.set_system_time(900);
    h.mock.set_record_context(RecordContext {
        offset: 41,
        ..RecordContext::default()
    });
    h.processor.process(record("a", "v")).unwrap();

    // Live host clocks move on; the worker must not see it.
    h.mock.set_stream_time(10_000);
    h.mock.set_system_time(10_000);

    h.processor.flush_and_await().unwrap();
    assert_eq!(h.user.invocations(), 1);
    h.processor.close().unwrap();
}

#[test]
fn drain_pass_on_an_empty_pipeline_is_a_no_op() {
    let mut h = harness(&async_config(2, 1), &[], forward_all());
    h.mock.fire_tick();
    h.mock.fire_tick();
    assert_eq!(h.processor.pending_events(), 0);
    assert!(h.mock.forwarded().is_empty());
    h.processor.flush_and_await().unwrap();
    h.processor.close().unwrap();
}

#[test]
fn double_init_is_rejected() {
    let mut h = harness(&async_config(0, 1), &[], forward_all());
    let error = h.processor.init(Box::new(h.mock.context())).unwrap_err();
    assert!(matches!(
        error,
        crate::Error::Processor(ProcessorError::AlreadyInitialized { .. })
    ));
    h.processor.close().unwrap();
}

#[test]
fn store_set_mismatch_fails_init() {
    let mock: MockDriverContext<String, String> = MockDriverContext::new();
    mock.add_store("declared");
    mock.update_configs(|configs| {
        config::store_async_config(configs, &async_config(0, 1));
    });

    // Declared to the supplier, but the user's init never opens it.
    let user = Arc::new(TestProcessor::new(&[], forward_all()));
    let builders = vec![Arc::new(
        AsyncStoreBuilder::wrap(&StoreDescriptor::key_value("declared")).unwrap(),
    )];
    let mut processor = AsyncProcessor::new(user as _, builders);

    let error = processor.init(Box::new(mock.context())).unwrap_err();
    assert!(matches!(
        error,
        crate::Error::Processor(ProcessorError::StoreSetMismatch { .. })
    ));
    // The failed init tore its tick back down.
    assert_eq!(mock.active_tick_count(), 0);
}

#[test]
fn missing_pool_fails_init() {
    let mock: MockDriverContext<String, String> = MockDriverContext::new();
    let registry = Arc::new(PoolRegistry::new(2));
    mock.update_configs(|configs| {
        config::store_async_config(configs, &async_config(2, 1));
        config::store_pool_registry(configs, Arc::clone(&registry));
    });

    // Registry exists but no pool was registered for this driver thread.
    let user = Arc::new(TestProcessor::new(&[], forward_all()));
    let mut processor = AsyncProcessor::new(user as _, Vec::new());
    let error = processor.init(Box::new(mock.context())).unwrap_err();
    assert!(matches!(
        error,
        crate::Error::Processor(ProcessorError::MissingPool { .. })
    ));
}

#[test]
fn process_before_init_is_rejected() {
    let user = Arc::new(TestProcessor::new(&[], forward_all()));
    let mut processor: AsyncProcessor<String, String> = AsyncProcessor::new(user as _, Vec::new());
    let error = processor.process(record("a", "v")).unwrap_err();
    assert!(matches!(
        error,
        crate::Error::Processor(ProcessorError::NotInitialized)
    ));
}

#[test]
fn close_cancels_the_tick_and_unregisters() {
    let mut h = harness(&async_config(2, 1), &[], forward_all());
    assert_eq!(h.mock.active_tick_count(), 1);
    h.processor.flush_and_await().unwrap();
    h.processor.close().unwrap();
    assert_eq!(h.mock.active_tick_count(), 0);
}

#[test]
fn supplier_wraps_stores_and_registers_flush_listeners() {
    let supplier = AsyncProcessorSupplier::new(
        || Arc::new(TestProcessor::new(&["kv"], forward_all())) as _,
        &[StoreDescriptor::key_value("kv")],
    )
    .unwrap();
    assert_eq!(supplier.stores().len(), 1);

    let mock: MockDriverContext<String, String> = MockDriverContext::new();
    mock.add_store("kv");
    let config = async_config(0, 1);
    mock.update_configs(|configs| config::store_async_config(configs, &config));

    let mut processor = supplier.get();
    processor.init(Box::new(mock.context())).unwrap();
    processor.process(record("a", "v")).unwrap();

    // The host's commit path flushes through the store builder.
    supplier.stores()[0]
        .trigger_flush(&driver_name(), 0)
        .unwrap();
    assert_eq!(processor.pending_events(), 0);

    processor.close().unwrap();
    // After close the listener is gone; triggering again is a warning-only
    // no-op.
    supplier.stores()[0]
        .trigger_flush(&driver_name(), 0)
        .unwrap();
}

#[test]
fn windowed_stores_are_rejected_by_the_supplier() {
    let result = AsyncProcessorSupplier::<String, String>::new(
        || Arc::new(TestProcessor::new(&[], forward_all())) as _,
        &[StoreDescriptor {
            name: "w".to_string(),
            kind: crate::store::StoreKind::Windowed,
        }],
    );
    assert!(result.is_err());
}
