//! Behavior tests for the event poller: offset initialization and resume,
//! batching, verbatim batch retry with an observable failure count, notifier
//! wakes, and shutdown responsiveness.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use futures::future::BoxFuture;
use meshwork_aggregator::{
    EventHandler, EventNotifier, EventPoller, EventPollerConfig, RetryPolicy,
};
use meshwork_core::store::{Store, StoreError, StoreResult};
use meshwork_core::types::{
    Event, EventKind, FirstEvent, Offset, OffsetKind, AGGREGATOR_OFFSET_NAME, SYSTEM_NAMESPACE,
};
use meshwork_testing::InMemoryStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Records every batch it is handed (by sequence numbers), optionally
/// failing the first few invocations.
#[derive(Default)]
struct RecordingHandler {
    batches: tokio::sync::Mutex<Vec<Vec<i64>>>,
    failures_remaining: AtomicUsize,
}

impl RecordingHandler {
    fn failing(failures: usize) -> Self {
        let handler = Self::default();
        handler.failures_remaining.store(failures, Ordering::SeqCst);
        handler
    }

    async fn batches(&self) -> Vec<Vec<i64>> {
        self.batches.lock().await.clone()
    }
}

impl EventHandler for RecordingHandler {
    fn handle_batch<'a>(&'a self, events: &'a [Event]) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move {
            self.batches
                .lock()
                .await
                .push(events.iter().map(|e| e.sequence).collect());
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining
                    .store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Database("handler failure".to_string()));
            }
            Ok(false)
        })
    }
}

fn config(batch_size: usize, first_event: FirstEvent) -> EventPollerConfig {
    EventPollerConfig {
        batch_size,
        batch_timeout: Duration::ZERO,
        poll_timeout: Duration::from_millis(50),
        startup_attempts: 3,
        retry: RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(80), 2.0),
        first_event,
        offset_kind: OffsetKind::Aggregator,
        offset_namespace: SYSTEM_NAMESPACE.to_string(),
        offset_name: AGGREGATOR_OFFSET_NAME.to_string(),
    }
}

async fn seed_events(store: &InMemoryStore, count: usize) {
    for _ in 0..count {
        store
            .insert_event(&Event::new(
                EventKind::MessageSequencedBroadcast,
                "ns1",
                Uuid::new_v4(),
            ))
            .await
            .unwrap();
    }
}

async fn offset_row(store: &InMemoryStore) -> Option<i64> {
    store
        .offset_value(OffsetKind::Aggregator, SYSTEM_NAMESPACE, AGGREGATOR_OFFSET_NAME)
        .await
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn delivers_ordered_batches_capped_at_batch_size() {
    let store = Arc::new(InMemoryStore::new());
    seed_events(&store, 5).await;
    let handler = Arc::new(RecordingHandler::default());
    let (poller, shutdown) = EventPoller::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::new(EventNotifier::new()),
        config(2, FirstEvent::Oldest),
        Arc::clone(&handler) as Arc<dyn EventHandler>,
    );
    let running = tokio::spawn(poller.run());

    wait_until(|| {
        let handler = Arc::clone(&handler);
        async move { handler.batches().await.len() >= 3 }
    })
    .await;

    assert_eq!(handler.batches().await, vec![vec![1, 2], vec![3, 4], vec![5]]);
    // Starting from `oldest` creates the offset row at zero; durable commits
    // are the handler's job, so the row stays there.
    assert_eq!(offset_row(&store).await, Some(0));

    shutdown.send(true).ok();
    running.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn newest_skips_the_existing_log_until_woken() {
    let store = Arc::new(InMemoryStore::new());
    seed_events(&store, 3).await;
    let handler = Arc::new(RecordingHandler::default());
    let notifier = Arc::new(EventNotifier::new());
    let (poller, shutdown) = EventPoller::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&notifier),
        config(10, FirstEvent::Newest),
        Arc::clone(&handler) as Arc<dyn EventHandler>,
    );
    let running = tokio::spawn(poller.run());

    wait_until(|| {
        let store = Arc::clone(&store);
        async move { offset_row(&store).await == Some(3) }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(handler.batches().await.is_empty());

    // A new event plus a wake delivers just that event.
    seed_events(&store, 1).await;
    notifier.new_events();
    wait_until(|| {
        let handler = Arc::clone(&handler);
        async move { !handler.batches().await.is_empty() }
    })
    .await;
    assert_eq!(handler.batches().await, vec![vec![4]]);

    shutdown.send(true).ok();
    running.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn explicit_first_event_starts_delivery_at_that_sequence() {
    let store = Arc::new(InMemoryStore::new());
    seed_events(&store, 4).await;
    let handler = Arc::new(RecordingHandler::default());
    let (poller, shutdown) = EventPoller::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::new(EventNotifier::new()),
        config(10, FirstEvent::Sequence(3)),
        Arc::clone(&handler) as Arc<dyn EventHandler>,
    );
    let running = tokio::spawn(poller.run());

    wait_until(|| {
        let handler = Arc::clone(&handler);
        async move { !handler.batches().await.is_empty() }
    })
    .await;
    assert_eq!(handler.batches().await, vec![vec![3, 4]]);
    assert_eq!(offset_row(&store).await, Some(2));

    shutdown.send(true).ok();
    running.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn resumes_strictly_after_a_committed_offset() {
    let store = Arc::new(InMemoryStore::new());
    seed_events(&store, 3).await;
    store
        .upsert_offset(&Offset {
            kind: OffsetKind::Aggregator,
            namespace: SYSTEM_NAMESPACE.to_string(),
            name: AGGREGATOR_OFFSET_NAME.to_string(),
            current: 2,
        })
        .await
        .unwrap();
    let handler = Arc::new(RecordingHandler::default());
    let (poller, shutdown) = EventPoller::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::new(EventNotifier::new()),
        config(10, FirstEvent::Oldest),
        Arc::clone(&handler) as Arc<dyn EventHandler>,
    );
    let running = tokio::spawn(poller.run());

    wait_until(|| {
        let handler = Arc::clone(&handler);
        async move { !handler.batches().await.is_empty() }
    })
    .await;
    assert_eq!(handler.batches().await, vec![vec![3]]);

    shutdown.send(true).ok();
    running.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_batches_are_retried_verbatim() {
    let store = Arc::new(InMemoryStore::new());
    seed_events(&store, 2).await;
    let handler = Arc::new(RecordingHandler::failing(2));
    let (poller, shutdown) = EventPoller::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::new(EventNotifier::new()),
        config(10, FirstEvent::Oldest),
        Arc::clone(&handler) as Arc<dyn EventHandler>,
    );
    let monitor = poller.monitor();
    let running = tokio::spawn(poller.run());

    wait_until(|| {
        let handler = Arc::clone(&handler);
        async move { handler.batches().await.len() >= 3 }
    })
    .await;

    // Two failures and the success all saw the identical batch.
    assert_eq!(
        handler.batches().await,
        vec![vec![1, 2], vec![1, 2], vec![1, 2]]
    );
    assert_eq!(monitor.consecutive_failures(), 0);

    shutdown.send(true).ok();
    running.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn consecutive_failures_are_observable_while_a_batch_is_stuck() {
    let store = Arc::new(InMemoryStore::new());
    seed_events(&store, 1).await;
    let handler = Arc::new(RecordingHandler::failing(usize::MAX));
    let (poller, shutdown) = EventPoller::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::new(EventNotifier::new()),
        config(10, FirstEvent::Oldest),
        Arc::clone(&handler) as Arc<dyn EventHandler>,
    );
    let monitor = poller.monitor();
    let running = tokio::spawn(poller.run());

    let probe = monitor.clone();
    wait_until(move || {
        let probe = probe.clone();
        async move { probe.consecutive_failures() >= 3 }
    })
    .await;

    shutdown.send(true).ok();
    running.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn startup_offset_failure_is_fatal_after_all_attempts() {
    let store = Arc::new(InMemoryStore::new());
    store.fail_next_ops(1000);
    let (poller, _shutdown) = EventPoller::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::new(EventNotifier::new()),
        config(10, FirstEvent::Oldest),
        Arc::new(RecordingHandler::default()) as Arc<dyn EventHandler>,
    );

    let result = poller.run().await;
    assert!(matches!(result, Err(StoreError::Database(_))));
}

#[tokio::test(start_paused = true)]
async fn idle_poller_stops_promptly_on_shutdown() {
    let store = Arc::new(InMemoryStore::new());
    let (poller, shutdown) = EventPoller::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::new(EventNotifier::new()),
        config(10, FirstEvent::Oldest),
        Arc::new(RecordingHandler::default()) as Arc<dyn EventHandler>,
    );
    let running = tokio::spawn(poller.run());

    tokio::time::sleep(Duration::from_millis(10)).await;
    shutdown.send(true).ok();
    tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .expect("poller must stop promptly")
        .unwrap()
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn dropping_the_shutdown_sender_stops_the_poller() {
    let store = Arc::new(InMemoryStore::new());
    let (poller, shutdown) = EventPoller::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::new(EventNotifier::new()),
        config(10, FirstEvent::Oldest),
        Arc::new(RecordingHandler::default()) as Arc<dyn EventHandler>,
    );
    let running = tokio::spawn(poller.run());

    tokio::time::sleep(Duration::from_millis(10)).await;
    drop(shutdown);
    tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .expect("poller must stop when the sender is dropped")
        .unwrap()
        .unwrap();
}
