//! The aggregator core: the state machine that turns polled events into
//! confirmations, blocker transitions and derived events.

use crate::config::AggregatorConfig;
use crate::lookahead::Lookahead;
use crate::notifier::EventNotifier;
use crate::poller::{EventHandler, EventPoller, EventPollerConfig};
use chrono::Utc;
use futures::future::BoxFuture;
use meshwork_core::store::{
    BlockedUpdate, EventFilter, MessageRefFilter, MessageUpdate, Store, StoreResult,
};
use meshwork_core::system::SystemBroadcastHandler;
use meshwork_core::types::{
    Blocked, Event, EventKind, Message, Offset, OffsetKind, AGGREGATOR_OFFSET_NAME,
    SYSTEM_NAMESPACE,
};
use std::sync::Arc;
use tokio::sync::watch;

/// Correlates data-arrival and message-sequenced events, confirms messages
/// once every dependency is satisfied, and keeps each context's confirmations
/// in sequence order through blocked-context rows.
///
/// One instance runs per process. Each polled batch is processed inside a
/// single transactional group: derived events, confirmations, blocker
/// mutations and the offset commit either all persist or none do, which is
/// the only crash-consistency mechanism the aggregator needs: a failed
/// batch is simply retried verbatim.
pub struct Aggregator {
    store: Arc<dyn Store>,
    system: Arc<dyn SystemBroadcastHandler>,
}

impl Aggregator {
    /// Create an aggregator over a store and a system-broadcast handler.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, system: Arc<dyn SystemBroadcastHandler>) -> Self {
        Self { store, system }
    }

    /// Build the event poller that drives this aggregator, wired to the
    /// aggregator's own durable offset.
    #[must_use]
    pub fn poller(
        self: Arc<Self>,
        config: &AggregatorConfig,
        notifier: Arc<EventNotifier>,
    ) -> (EventPoller, watch::Sender<bool>) {
        EventPoller::new(
            Arc::clone(&self.store),
            notifier,
            EventPollerConfig {
                batch_size: config.batch_size,
                batch_timeout: config.batch_timeout,
                poll_timeout: config.poll_timeout,
                startup_attempts: config.startup_attempts,
                retry: config.retry_policy(),
                first_event: config.first_event,
                offset_kind: OffsetKind::Aggregator,
                offset_namespace: SYSTEM_NAMESPACE.to_string(),
                offset_name: AGGREGATOR_OFFSET_NAME.to_string(),
            },
            self as Arc<dyn EventHandler>,
        )
    }

    async fn process_events(&self, events: &[Event]) -> StoreResult<bool> {
        // Index the batch by reference so double-processing can be optimized
        // out: an event later in the batch may re-trigger the same check.
        let mut lookahead = Lookahead::build(events);

        let mut repoll = false;
        for event in events {
            let removed = lookahead.remove(event.id);
            tracing::debug!(
                sequence = event.sequence,
                event_id = %event.id,
                kind = %event.kind,
                namespace = %event.namespace,
                reference = %event.reference,
                removed,
                "Aggregating event"
            );
            repoll |= self.process_event(&lookahead, event).await?;
        }

        if let Some(last) = events.last() {
            self.commit_offset(last.sequence).await?;
        }
        Ok(repoll)
    }

    async fn process_event(&self, lookahead: &Lookahead, event: &Event) -> StoreResult<bool> {
        match &event.kind {
            EventKind::DataArrivedBroadcast => {
                return self.process_data_arrived(lookahead, event).await;
            }
            EventKind::MessageSequencedBroadcast => {
                let message = self.store.get_message_by_id(event.reference).await?;
                match message {
                    Some(message) if message.confirmed.is_none() => {
                        return self.check_message_complete(lookahead, &message, event).await;
                    }
                    Some(_) => {}
                    None => {
                        // The event stream is append-only and eventually
                        // consistent with the message store; a missing row is
                        // expected transiently and must not fail the batch.
                        tracing::debug!(
                            reference = %event.reference,
                            "Sequenced event refers to a missing message"
                        );
                    }
                }
            }
            // Derived kinds MUST stay inert here: the aggregator emitted
            // them, and reacting to them would feed the loop its own output
            // forever.
            kind if kind.is_derived() => {}
            // Unknown kinds belong to other subsystems.
            _ => {}
        }
        tracing::debug!(
            sequence = event.sequence,
            event_id = %event.id,
            kind = %event.kind,
            "No aggregation action for event"
        );
        Ok(false)
    }

    /// A data blob became available: re-check every unconfirmed message that
    /// references it, unless an upcoming sequenced event in this batch will
    /// drive the same check.
    async fn process_data_arrived(
        &self,
        lookahead: &Lookahead,
        event: &Event,
    ) -> StoreResult<bool> {
        let messages = self
            .store
            .get_messages_for_data(event.reference, &event.namespace)
            .await?;

        let mut repoll = false;
        for message in &messages {
            tracing::info!(
                data = %event.reference,
                message = %message.id,
                "Data arrived for message"
            );
            if lookahead.has_any_of(message.id, &[EventKind::MessageSequencedBroadcast]) {
                tracing::debug!(
                    message = %message.id,
                    "Skipping completion check, upcoming sequenced event in batch"
                );
                continue;
            }
            repoll |= self.check_message_complete(lookahead, message, event).await?;
        }
        Ok(repoll)
    }

    /// Look up the blocker of the message's context, creating one pointed at
    /// this message when the context is open but the message cannot complete
    /// yet. An existing blocker is returned unchanged; only the unblock step
    /// of [`check_message_complete`](Self::check_message_complete) redirects
    /// or deletes it.
    async fn check_update_context_blocked(
        &self,
        message: &Message,
        complete: bool,
    ) -> StoreResult<Option<Blocked>> {
        let mut blocked = self
            .store
            .get_blocked_by_context(&message.namespace, &message.context, message.group)
            .await?;

        let mut changed = false;
        if blocked.is_none() && !complete {
            let new_blocker = Blocked::new(
                message.namespace.clone(),
                message.context.clone(),
                message.group,
                message.id,
            );
            self.store.insert_blocked(&new_blocker).await?;
            changed = true;
            blocked = Some(new_blocker);
        }

        if let Some(blocked) = &blocked {
            tracing::info!(
                namespace = %message.namespace,
                context = %message.context,
                group = ?message.group,
                blocker = %blocked.message,
                changed,
                "Context blocked"
            );
        }
        Ok(blocked)
    }

    /// Decide whether a message can be confirmed, and confirm it if so.
    ///
    /// A message confirms only when its envelope has been sequenced, all its
    /// data is available, and its context is either unblocked or blocked by
    /// the message itself. Confirming the context head redirects the blocker
    /// to the next uncomplete message (emitting `messages-unblocked` unless
    /// the batch already contains an event that will re-check it) or deletes
    /// the blocker when no successor exists.
    async fn check_message_complete(
        &self,
        lookahead: &Lookahead,
        message: &Message,
        event: &Event,
    ) -> StoreResult<bool> {
        // Triggered by data arrival: the envelope itself may not have been
        // sequenced yet, in which case a later event will retry.
        if event.reference != message.id {
            let sequenced = self
                .store
                .get_events(
                    EventFilter::by_reference(message.id, EventKind::MessageSequencedBroadcast)
                        .with_limit(1),
                )
                .await?;
            if sequenced.is_empty() {
                return Ok(false);
            }
        }

        let complete = self.store.check_data_available(message).await?;

        let blocked_by = self.check_update_context_blocked(message, complete).await?;
        if !complete
            || blocked_by
                .as_ref()
                .is_some_and(|blocked| blocked.message != message.id)
        {
            // Re-examined when the blocker resolves or the data arrives.
            return Ok(false);
        }

        // System messages are handled in-line, before confirmation, so
        // applications never see events that depend on unprocessed system
        // definitions. Handler errors must be retryable.
        if message.namespace == SYSTEM_NAMESPACE {
            self.system.handle_system_broadcast(message).await?;
        }

        self.store
            .update_message(
                message.id,
                MessageUpdate {
                    confirmed: Some(Utc::now()),
                },
            )
            .await?;
        self.store
            .insert_event(&Event::new(
                EventKind::MessageConfirmed,
                message.namespace.clone(),
                message.id,
            ))
            .await?;

        let unblock = blocked_by
            .as_ref()
            .is_some_and(|blocked| blocked.message == message.id);
        tracing::info!(
            namespace = %message.namespace,
            context = %message.context,
            group = ?message.group,
            message = %message.id,
            unblock,
            "Message confirmed"
        );

        let mut repoll = false;
        if let Some(blocked_by) = blocked_by.filter(|blocked| blocked.message == message.id) {
            // Check forwards for a successor this confirmation unblocks.
            let unblockable = self
                .store
                .get_message_refs(MessageRefFilter {
                    namespace: message.namespace.clone(),
                    context: message.context.clone(),
                    group: message.group,
                    after_sequence: Some(message.sequence),
                    unconfirmed_only: true,
                    limit: Some(1),
                })
                .await?;

            if let Some(next) = unblockable.first() {
                tracing::info!(
                    message = %message.id,
                    sequence = message.sequence,
                    unblocks = %next.id,
                    unblocks_sequence = next.sequence,
                    "Redirecting context blocker"
                );
                self.store
                    .update_blocked(blocked_by.id, BlockedUpdate { message: next.id })
                    .await?;

                if lookahead.has_any_of(
                    next.id,
                    &[
                        EventKind::MessageConfirmed,
                        EventKind::MessageSequencedBroadcast,
                    ],
                ) {
                    tracing::debug!(
                        message = %next.id,
                        "Not queuing unblocked event, upcoming event in batch"
                    );
                } else {
                    self.store
                        .insert_event(&Event::new(
                            EventKind::MessagesUnblocked,
                            message.namespace.clone(),
                            next.id,
                        ))
                        .await?;
                    // Fire the poll loop again to pick up the unblock event.
                    repoll = true;
                }
            } else {
                self.store.delete_blocked(blocked_by.id).await?;
            }
        }

        Ok(repoll)
    }

    /// Advance the durable offset as part of the batch's transaction.
    async fn commit_offset(&self, sequence: i64) -> StoreResult<()> {
        self.store
            .upsert_offset(&Offset {
                kind: OffsetKind::Aggregator,
                namespace: SYSTEM_NAMESPACE.to_string(),
                name: AGGREGATOR_OFFSET_NAME.to_string(),
                current: sequence,
            })
            .await
    }
}

impl EventHandler for Aggregator {
    fn handle_batch<'a>(&'a self, events: &'a [Event]) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move {
            let mut repoll = false;
            self.store
                .run_as_group(Box::pin(async {
                    repoll = self.process_events(events).await?;
                    Ok(())
                }))
                .await?;
            Ok(repoll)
        })
    }
}
