//! The event poller: a single long-running loop that reads the event log in
//! bounded batches and hands them to a handler.
//!
//! The poller owns one durable offset. On startup the offset row is read or
//! created with bounded retries; a persistent failure is fatal. From then
//! on the loop reads everything after the in-memory cursor, up to
//! `batch_size` rows at a time, and dispatches each batch. A failed batch is
//! retried verbatim with capped exponential backoff, forever: the poller
//! must not starve, so the delay stops growing at the cap and the
//! consecutive-failure count stays observable through [`PollerMonitor`].
//!
//! Durable offset commits happen inside the handler's own transaction, so
//! derived writes and the cursor advance atomically; the poller only moves
//! its in-memory cursor after the handler succeeds.
//!
//! The loop can be cancelled at its suspension points (the idle wait and
//! the retry sleeps) through the `watch` channel returned by
//! [`EventPoller::new`].

use crate::notifier::EventNotifier;
use crate::retry::RetryPolicy;
use futures::future::BoxFuture;
use meshwork_core::store::{EventFilter, Store, StoreResult};
use meshwork_core::types::{Event, FirstEvent, Offset, OffsetKind};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Consumer of polled event batches.
///
/// The handler is expected to wrap the batch in a transactional group, commit
/// the poller's offset to the batch's last sequence as part of that group,
/// and return whether another poll should start immediately because derived
/// events are waiting at the tail (`repoll`). Errors abort and roll back the
/// batch; the poller will retry it verbatim.
pub trait EventHandler: Send + Sync {
    /// Process one batch, ordered by sequence ascending and never empty.
    fn handle_batch<'a>(&'a self, events: &'a [Event]) -> BoxFuture<'a, StoreResult<bool>>;
}

/// Configuration of an [`EventPoller`].
#[derive(Debug, Clone)]
pub struct EventPollerConfig {
    /// Maximum events per batch.
    pub batch_size: usize,
    /// Coalescing wait when a fresh batch under-fills; zero disables it.
    pub batch_timeout: Duration,
    /// Idle wait when the log is empty.
    pub poll_timeout: Duration,
    /// Attempts for the startup offset load.
    pub startup_attempts: u32,
    /// Backoff schedule for retries.
    pub retry: RetryPolicy,
    /// Where to start when the offset row does not exist yet.
    pub first_event: FirstEvent,
    /// Kind of the durable offset row.
    pub offset_kind: OffsetKind,
    /// Namespace of the durable offset row.
    pub offset_namespace: String,
    /// Name of the durable offset row.
    pub offset_name: String,
}

/// Shared view of a poller's health, observable from outside the loop.
#[derive(Clone, Debug, Default)]
pub struct PollerMonitor {
    failures: Arc<AtomicU32>,
}

impl PollerMonitor {
    /// Number of consecutive failed store interactions (reads or batch
    /// dispatches). Resets to zero on the next success.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn reset(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }
}

/// Reads the event log in sequence order and drives an [`EventHandler`].
pub struct EventPoller {
    store: Arc<dyn Store>,
    notifier: Arc<EventNotifier>,
    handler: Arc<dyn EventHandler>,
    config: EventPollerConfig,
    monitor: PollerMonitor,
    shutdown: watch::Receiver<bool>,
}

impl EventPoller {
    /// Create a poller and the sender used to shut it down.
    ///
    /// Send `true` (or drop the sender) to stop the loop at its next
    /// suspension point.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<EventNotifier>,
        config: EventPollerConfig,
        handler: Arc<dyn EventHandler>,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poller = Self {
            store,
            notifier,
            handler,
            config,
            monitor: PollerMonitor::default(),
            shutdown: shutdown_rx,
        };
        (poller, shutdown_tx)
    }

    /// Get a handle for observing the poller's consecutive-failure count.
    #[must_use]
    pub fn monitor(&self) -> PollerMonitor {
        self.monitor.clone()
    }

    /// Run until shutdown. Returns an error only if the startup offset load
    /// exhausts its attempts.
    pub async fn run(self) -> StoreResult<()> {
        let mut shutdown = self.shutdown.clone();

        let Some(mut offset) = self.startup_offset(&mut shutdown).await? else {
            return Ok(());
        };
        tracing::info!(
            offset,
            name = %self.config.offset_name,
            "Event poller started"
        );

        // A batch is "fresh" when it is the first read of an idle period;
        // only fresh under-filled batches get the coalescing wait.
        let mut fresh = true;
        while !*shutdown.borrow() {
            let Some(mut events) = self.read_batch(offset, &mut shutdown).await else {
                break;
            };

            if events.is_empty() {
                fresh = true;
                if !self.idle_wait(&mut shutdown).await {
                    break;
                }
                continue;
            }

            if fresh && events.len() < self.config.batch_size && !self.config.batch_timeout.is_zero()
            {
                if !sleep_or_shutdown(self.config.batch_timeout, &mut shutdown).await {
                    break;
                }
                let Some(refetched) = self.read_batch(offset, &mut shutdown).await else {
                    break;
                };
                if !refetched.is_empty() {
                    events = refetched;
                }
            }
            fresh = false;

            let Some(repoll) = self.dispatch(&events, &mut shutdown).await else {
                break;
            };
            offset = events.last().map_or(offset, |e| e.sequence);
            // The loop re-reads immediately either way; repoll means derived
            // events are already waiting at the tail, and the batch stays
            // non-fresh so they are picked up without a coalescing wait.
            tracing::debug!(offset, repoll, batch = events.len(), "Batch processed");
        }

        tracing::info!("Event poller stopped");
        Ok(())
    }

    /// Read or create the offset row. `Ok(None)` means shutdown was requested
    /// mid-startup.
    async fn startup_offset(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> StoreResult<Option<i64>> {
        let attempts = self.config.startup_attempts.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.config.retry.delay_for_attempt(attempt - 1);
                if !sleep_or_shutdown(delay, shutdown).await {
                    return Ok(None);
                }
            }
            match self.load_or_create_offset().await {
                Ok(offset) => return Ok(Some(offset)),
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "Failed to load aggregator offset");
                    last_err = Some(err);
                }
            }
        }
        tracing::error!(attempts, "Giving up on startup offset load");
        Err(last_err.unwrap_or_else(|| {
            meshwork_core::store::StoreError::Database("offset load failed".to_string())
        }))
    }

    async fn load_or_create_offset(&self) -> StoreResult<i64> {
        let config = &self.config;
        if let Some(offset) = self
            .store
            .get_offset(
                config.offset_kind,
                &config.offset_namespace,
                &config.offset_name,
            )
            .await?
        {
            tracing::info!(offset = offset.current, "Resuming from committed offset");
            return Ok(offset.current);
        }

        let current = match config.first_event {
            FirstEvent::Oldest => 0,
            FirstEvent::Newest => self.store.highest_event_sequence().await?.unwrap_or(0),
            FirstEvent::Sequence(sequence) => sequence.saturating_sub(1),
        };
        self.store
            .upsert_offset(&Offset {
                kind: config.offset_kind,
                namespace: config.offset_namespace.clone(),
                name: config.offset_name.clone(),
                current,
            })
            .await?;
        tracing::info!(
            offset = current,
            first_event = ?config.first_event,
            "Created aggregator offset"
        );
        Ok(current)
    }

    /// Query the next batch, retrying store errors with backoff. `None` means
    /// shutdown was requested.
    async fn read_batch(
        &self,
        offset: i64,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Vec<Event>> {
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                return None;
            }
            let filter = EventFilter::batch(offset, self.config.batch_size as i64);
            match self.store.get_events(filter).await {
                Ok(events) => {
                    self.monitor.reset();
                    return Some(events);
                }
                Err(err) => {
                    let failures = self.monitor.record_failure();
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        error = %err,
                        consecutive_failures = failures,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Event query failed, backing off"
                    );
                    attempt = attempt.saturating_add(1);
                    if !sleep_or_shutdown(delay, shutdown).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Hand a batch to the handler, retrying the same batch verbatim until it
    /// succeeds. `None` means shutdown was requested.
    async fn dispatch(
        &self,
        events: &[Event],
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<bool> {
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                return None;
            }
            match self.handler.handle_batch(events).await {
                Ok(repoll) => {
                    self.monitor.reset();
                    return Some(repoll);
                }
                Err(err) => {
                    let failures = self.monitor.record_failure();
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        error = %err,
                        consecutive_failures = failures,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Batch processing failed, will retry the same batch"
                    );
                    attempt = attempt.saturating_add(1);
                    if !sleep_or_shutdown(delay, shutdown).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Wait for a notifier wake or the poll timeout. Returns `false` on
    /// shutdown.
    async fn idle_wait(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            () = self.notifier.wait() => {
                tracing::debug!("Woken by notifier");
                true
            }
            () = tokio::time::sleep(self.config.poll_timeout) => true,
            changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
        }
    }
}

/// Sleep, returning early with `false` if shutdown is requested (or the
/// shutdown sender is dropped).
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}
