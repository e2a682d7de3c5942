//! Concrete end-to-end scenarios exercising the full write → lease →
//! dispatch → finalize cycle against the in-memory backend.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use durable_inbox::storage::memory::MemoryStorageProvider;
use durable_inbox::{
    BatchHandler, BatchItemResult, Envelope, Handler, HandlerOutcome, HandlerRegistry, InboxOptions,
    NewMessage, PerMessageHandler, ProcessingMode, StorageProvider, Worker, WriteOutcome, Writer,
};
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn run_briefly(worker: Worker, duration: Duration) {
    let shutdown = worker.shutdown_handle();
    let handle = tokio::spawn(async move { worker.run().await });
    tokio::time::sleep(duration).await;
    shutdown.cancel();
    handle.await.unwrap();
}

/// Scenario 1: a handler that always fails exhausts `max_attempts` and lands
/// in the dead-letter queue.
#[tokio::test]
async fn always_failing_handler_reaches_dead_letter_queue() {
    init_tracing();
    let clock = Arc::new(durable_inbox::clock::TestClock::new(Utc::now()));
    let storage = Arc::new(MemoryStorageProvider::new(clock.clone()));
    let mut options = InboxOptions::new(ProcessingMode::Default);
    options.max_attempts = 3;
    options.polling_interval = Duration::from_millis(5);

    let writer = Writer::new("orders", &options, storage.clone(), clock.clone());
    writer.write(NewMessage::new("ship", vec![1])).await.unwrap();

    struct AlwaysFails(Arc<AtomicUsize>);
    #[async_trait]
    impl PerMessageHandler for AlwaysFails {
        async fn handle(&self, _envelope: &Envelope, _shutdown: &CancellationToken) -> HandlerOutcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            HandlerOutcome::Failed { reason: Some("boom".to_string()) }
        }
    }

    let invocations = Arc::new(AtomicUsize::new(0));
    let handlers = HandlerRegistry::new();
    handlers.register("ship", Handler::PerMessage(Arc::new(AlwaysFails(invocations.clone()))));

    let worker = Worker::new("orders", options, storage.clone(), handlers, clock);
    run_briefly(worker, Duration::from_millis(200)).await;

    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    let dead_letters = storage.read_dead_letters("orders", 10).await.unwrap();
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].failure_reason, "boom");
}

/// Scenario 2: two writes sharing a collapse key leave only the later one
/// pending, so the handler sees it exactly once.
#[tokio::test]
async fn collapse_key_keeps_only_the_latest_write() {
    init_tracing();
    let clock = Arc::new(durable_inbox::clock::TestClock::new(Utc::now()));
    let storage = Arc::new(MemoryStorageProvider::new(clock.clone()));
    let options = InboxOptions::new(ProcessingMode::Default);
    let writer = Writer::new("prices", &options, storage.clone(), clock.clone());

    writer
        .write(NewMessage::new("price-update", b"a".to_vec()).with_collapse_key("AAPL"))
        .await
        .unwrap();
    writer
        .write(NewMessage::new("price-update", b"b".to_vec()).with_collapse_key("AAPL"))
        .await
        .unwrap();

    struct RecordPayload(Arc<std::sync::Mutex<Vec<Vec<u8>>>>);
    #[async_trait]
    impl PerMessageHandler for RecordPayload {
        async fn handle(&self, envelope: &Envelope, _shutdown: &CancellationToken) -> HandlerOutcome {
            self.0.lock().unwrap().push(envelope.payload.clone());
            HandlerOutcome::Success
        }
    }

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let handlers = HandlerRegistry::new();
    handlers.register("price-update", Handler::PerMessage(Arc::new(RecordPayload(seen.clone()))));

    let mut options = InboxOptions::new(ProcessingMode::Default);
    options.polling_interval = Duration::from_millis(5);
    let worker = Worker::new("prices", options, storage, handlers, clock);
    run_briefly(worker, Duration::from_millis(100)).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0], b"b".to_vec());
}

/// Scenario 3: a second write with the same deduplication id inside the
/// window is rejected and never reaches a handler.
#[tokio::test]
async fn dedup_window_rejects_second_write() {
    init_tracing();
    let clock = Arc::new(durable_inbox::clock::TestClock::new(Utc::now()));
    let storage = Arc::new(MemoryStorageProvider::new(clock.clone()));
    let mut options = InboxOptions::new(ProcessingMode::Default);
    options.enable_deduplication = true;
    options.deduplication_interval = Duration::from_secs(60 * 60);
    let writer = Writer::new("payments", &options, storage.clone(), clock.clone());

    let first = writer
        .write(NewMessage::new("charge", vec![1]).with_deduplication_id("D"))
        .await
        .unwrap();
    clock.advance(chrono::Duration::minutes(1));
    let second = writer
        .write(NewMessage::new("charge", vec![2]).with_deduplication_id("D"))
        .await
        .unwrap();

    assert_eq!(first, WriteOutcome::Inserted);
    assert_eq!(second, WriteOutcome::Duplicate);

    struct CountInvocations(Arc<AtomicUsize>);
    #[async_trait]
    impl PerMessageHandler for CountInvocations {
        async fn handle(&self, _envelope: &Envelope, _shutdown: &CancellationToken) -> HandlerOutcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            HandlerOutcome::Success
        }
    }

    let invocations = Arc::new(AtomicUsize::new(0));
    let handlers = HandlerRegistry::new();
    handlers.register("charge", Handler::PerMessage(Arc::new(CountInvocations(invocations.clone()))));

    let mut run_options = InboxOptions::new(ProcessingMode::Default);
    run_options.polling_interval = Duration::from_millis(5);
    let worker = Worker::new("payments", run_options, storage, handlers, clock);
    run_briefly(worker, Duration::from_millis(100)).await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

/// Scenario 4: FIFO preserves per-group order while leaving cross-group
/// order unconstrained.
#[tokio::test]
async fn fifo_preserves_order_within_each_group() {
    init_tracing();
    let clock = Arc::new(durable_inbox::clock::TestClock::new(Utc::now()));
    let storage = Arc::new(MemoryStorageProvider::new(clock.clone()));
    let mut options = InboxOptions::new(ProcessingMode::Fifo);
    options.read_batch_size = 10;
    let writer = Writer::new("events", &options, storage.clone(), clock.clone());

    for seq in 0..5u8 {
        writer
            .write(NewMessage::new("event", vec![seq]).with_group_id("G1"))
            .await
            .unwrap();
        writer
            .write(NewMessage::new("event", vec![seq]).with_group_id("G2"))
            .await
            .unwrap();
    }

    struct RecordSequence {
        by_group: std::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>,
        total: AtomicUsize,
    }
    #[async_trait]
    impl PerMessageHandler for RecordSequence {
        async fn handle(&self, envelope: &Envelope, _shutdown: &CancellationToken) -> HandlerOutcome {
            self.total.fetch_add(1, Ordering::SeqCst);
            let group = envelope.group_id.clone().unwrap();
            self.by_group.lock().unwrap().entry(group).or_default().push(envelope.payload[0]);
            HandlerOutcome::Success
        }
    }

    let recorder = Arc::new(RecordSequence {
        by_group: std::sync::Mutex::new(std::collections::HashMap::new()),
        total: AtomicUsize::new(0),
    });
    let handlers = HandlerRegistry::new();
    handlers.register("event", Handler::PerMessage(recorder.clone()));

    let mut run_options = InboxOptions::new(ProcessingMode::Fifo);
    run_options.read_batch_size = 10;
    run_options.polling_interval = Duration::from_millis(5);
    let worker = Worker::new("events", run_options, storage, handlers, clock);
    run_briefly(worker, Duration::from_millis(200)).await;

    assert_eq!(recorder.total.load(Ordering::SeqCst), 10);
    let by_group = recorder.by_group.lock().unwrap();
    assert_eq!(by_group.get("G1").unwrap(), &vec![0, 1, 2, 3, 4]);
    assert_eq!(by_group.get("G2").unwrap(), &vec![0, 1, 2, 3, 4]);
}

/// Scenario 5: two FIFO workers sharing one group never process that
/// group's messages concurrently.
#[tokio::test]
async fn fifo_group_lock_excludes_concurrent_workers() {
    init_tracing();
    let clock: Arc<dyn durable_inbox::clock::Clock> = Arc::new(durable_inbox::clock::SystemClock);
    let storage = Arc::new(MemoryStorageProvider::new(clock.clone()));
    let mut options = InboxOptions::new(ProcessingMode::Fifo);
    options.read_batch_size = 1;
    let writer = Writer::new("jobs", &options, storage.clone(), clock.clone());

    for seq in 0..3u8 {
        writer
            .write(NewMessage::new("job", vec![seq]).with_group_id("G1"))
            .await
            .unwrap();
    }

    struct SlowExclusive {
        active: Arc<AtomicUsize>,
        overlapped: Arc<AtomicBool>,
    }
    #[async_trait]
    impl PerMessageHandler for SlowExclusive {
        async fn handle(&self, _envelope: &Envelope, _shutdown: &CancellationToken) -> HandlerOutcome {
            if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            HandlerOutcome::Success
        }
    }

    let active = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));
    let handlers = HandlerRegistry::new();
    handlers.register(
        "job",
        Handler::PerMessage(Arc::new(SlowExclusive { active: active.clone(), overlapped: overlapped.clone() })),
    );

    let mut run_options = InboxOptions::new(ProcessingMode::Fifo);
    run_options.read_batch_size = 1;
    run_options.polling_interval = Duration::from_millis(5);
    let worker_a = Worker::new("jobs", run_options.clone(), storage.clone(), handlers.clone(), clock.clone());
    let worker_b = Worker::new("jobs", run_options, storage, handlers, clock);

    let shutdown_a = worker_a.shutdown_handle();
    let shutdown_b = worker_b.shutdown_handle();
    let handle_a = tokio::spawn(async move { worker_a.run().await });
    let handle_b = tokio::spawn(async move { worker_b.run().await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown_a.cancel();
    shutdown_b.cancel();
    handle_a.await.unwrap();
    handle_b.await.unwrap();

    assert!(!overlapped.load(Ordering::SeqCst));
}

/// Scenario 6: a batched handler's mixed outcomes are finalized atomically
/// and attempts bookkeeping matches the translation table.
#[tokio::test]
async fn batched_handler_mixed_outcomes_finalize_together() {
    init_tracing();
    let clock = Arc::new(durable_inbox::clock::TestClock::new(Utc::now()));
    let storage = Arc::new(MemoryStorageProvider::new(clock.clone()));
    let options = InboxOptions::new(ProcessingMode::Default);
    let writer = Writer::new("bulk", &options, storage.clone(), clock.clone());

    // Write and fail "c" twice up front, in isolation, so its attempts_count
    // reaches 2 before "a" and "b" ever show up in the inbox.
    writer.write(NewMessage::new("bulk-op", b"c".to_vec())).await.unwrap();

    struct AlwaysFails;
    #[async_trait]
    impl PerMessageHandler for AlwaysFails {
        async fn handle(&self, _envelope: &Envelope, _shutdown: &CancellationToken) -> HandlerOutcome {
            HandlerOutcome::Failed { reason: Some("bootstrap".to_string()) }
        }
    }
    let bootstrap_handlers = HandlerRegistry::new();
    bootstrap_handlers.register("bulk-op", Handler::PerMessage(Arc::new(AlwaysFails)));
    let mut bootstrap_options = InboxOptions::new(ProcessingMode::Default);
    bootstrap_options.max_attempts = 3;
    // A long read_delay keeps each run_briefly window to a single lease cycle
    // instead of racing straight back into a second one.
    bootstrap_options.read_delay = Duration::from_millis(500);
    for _ in 0..2 {
        let worker = Worker::new(
            "bulk",
            bootstrap_options.clone(),
            storage.clone(),
            bootstrap_handlers.clone(),
            clock.clone(),
        );
        run_briefly(worker, Duration::from_millis(50)).await;
    }

    writer.write(NewMessage::new("bulk-op", b"a".to_vec())).await.unwrap();
    writer.write(NewMessage::new("bulk-op", b"b".to_vec())).await.unwrap();

    struct MixedOutcomes;
    #[async_trait]
    impl BatchHandler for MixedOutcomes {
        async fn handle_batch(&self, envelopes: &[Envelope], _shutdown: &CancellationToken) -> Vec<BatchItemResult> {
            envelopes
                .iter()
                .map(|e| {
                    let outcome = match e.payload.as_slice() {
                        b"a" => HandlerOutcome::Success,
                        b"b" => HandlerOutcome::Retry,
                        _ => HandlerOutcome::Failed { reason: Some("still broken".to_string()) },
                    };
                    BatchItemResult { id: e.id, outcome }
                })
                .collect()
        }
    }

    let handlers = HandlerRegistry::new();
    handlers.register("bulk-op", Handler::Batch(Arc::new(MixedOutcomes)));

    let mut run_options = InboxOptions::new(ProcessingMode::Batched);
    run_options.max_attempts = 3;
    run_options.polling_interval = Duration::from_millis(5);
    let worker = Worker::new("bulk", run_options, storage.clone(), handlers, clock);
    run_briefly(worker, Duration::from_millis(100)).await;

    let dead_letters = storage.read_dead_letters("bulk", 10).await.unwrap();
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].attempts_count, 2);

    let metrics = storage.health_metrics("bulk", Duration::from_secs(300)).await.unwrap();
    // "a" completed and removed, "c" dead-lettered and removed: only "b" remains pending.
    assert_eq!(metrics.pending_count, 1);
    assert_eq!(metrics.dead_letter_count, 1);
}
