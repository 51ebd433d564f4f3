//! In-memory [`Store`] implementation.

use futures::future::BoxFuture;
use meshwork_core::store::{
    BlockedUpdate, EventFilter, MessageRefFilter, MessageUpdate, Store, StoreError, StoreResult,
};
use meshwork_core::types::{Blocked, Event, Message, MessageRef, Offset, OffsetKind};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Clone, Default)]
struct State {
    events: Vec<Event>,
    next_sequence: i64,
    messages: HashMap<Uuid, Message>,
    data: HashSet<Uuid>,
    blocked: Vec<Blocked>,
    offsets: HashMap<(OffsetKind, String, String), i64>,
}

/// A deterministic, in-memory [`Store`].
///
/// Sequences are assigned from 1 upward in insertion order, so tests can
/// predict them. [`run_as_group`](Store::run_as_group) snapshots the whole
/// state before running the work and restores the snapshot on error, giving
/// the same rollback semantics as the Postgres implementation.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    snapshot: Mutex<Option<State>>,
    skip_remaining: AtomicUsize,
    fail_remaining: AtomicUsize,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` store operations fail with an injected database
    /// error. Group bookkeeping (snapshot, restore) is not affected.
    pub fn fail_next_ops(&self, n: usize) {
        self.fail_after_ops(0, n);
    }

    /// Let the next `skip` store operations succeed, then fail the `n` after
    /// that. Useful for failing partway through a batch so rollback of
    /// partial writes can be exercised.
    pub fn fail_after_ops(&self, skip: usize, n: usize) {
        self.skip_remaining.store(skip, Ordering::SeqCst);
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Seed a message, as the external ingestion path would.
    pub async fn insert_message(&self, message: Message) {
        let mut state = self.state.lock().await;
        state.messages.insert(message.id, message);
    }

    /// Mark a data blob as locally available.
    pub async fn insert_data(&self, data_id: Uuid) {
        let mut state = self.state.lock().await;
        state.data.insert(data_id);
    }

    /// Every event currently in the log, in sequence order.
    pub async fn events(&self) -> Vec<Event> {
        self.state.lock().await.events.clone()
    }

    /// Every blocked row currently in the store.
    pub async fn blocked_rows(&self) -> Vec<Blocked> {
        self.state.lock().await.blocked.clone()
    }

    /// Fetch a message without going through the trait (no fault injection).
    pub async fn message(&self, id: Uuid) -> Option<Message> {
        self.state.lock().await.messages.get(&id).cloned()
    }

    /// The committed value of an offset, if the row exists.
    pub async fn offset_value(&self, kind: OffsetKind, namespace: &str, name: &str) -> Option<i64> {
        self.state
            .lock()
            .await
            .offsets
            .get(&(kind, namespace.to_string(), name.to_string()))
            .copied()
    }

    fn maybe_fail(&self) -> StoreResult<()> {
        loop {
            let skip = self.skip_remaining.load(Ordering::SeqCst);
            if skip > 0 {
                if self
                    .skip_remaining
                    .compare_exchange(skip, skip - 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            let remaining = self.fail_remaining.load(Ordering::SeqCst);
            if remaining == 0 {
                return Ok(());
            }
            if self
                .fail_remaining
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Err(StoreError::Database("injected failure".to_string()));
            }
        }
    }
}

fn matches_event(event: &Event, filter: &EventFilter) -> bool {
    filter.reference.is_none_or(|r| event.reference == r)
        && filter.kind.as_ref().is_none_or(|k| &event.kind == k)
        && filter.after_sequence.is_none_or(|s| event.sequence > s)
}

impl Store for InMemoryStore {
    fn get_events(&self, filter: EventFilter) -> BoxFuture<'_, StoreResult<Vec<Event>>> {
        Box::pin(async move {
            self.maybe_fail()?;
            let state = self.state.lock().await;
            let mut events: Vec<Event> = state
                .events
                .iter()
                .filter(|e| matches_event(e, &filter))
                .cloned()
                .collect();
            events.sort_by_key(|e| e.sequence);
            if let Some(limit) = filter.limit {
                events.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
            }
            Ok(events)
        })
    }

    fn insert_event<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.maybe_fail()?;
            let mut state = self.state.lock().await;
            if state.events.iter().any(|e| e.id == event.id) {
                return Err(StoreError::Duplicate(event.id));
            }
            let mut event = event.clone();
            state.next_sequence += 1;
            event.sequence = state.next_sequence;
            state.events.push(event);
            Ok(())
        })
    }

    fn highest_event_sequence(&self) -> BoxFuture<'_, StoreResult<Option<i64>>> {
        Box::pin(async move {
            self.maybe_fail()?;
            let state = self.state.lock().await;
            Ok(state.events.iter().map(|e| e.sequence).max())
        })
    }

    fn get_message_by_id(&self, id: Uuid) -> BoxFuture<'_, StoreResult<Option<Message>>> {
        Box::pin(async move {
            self.maybe_fail()?;
            Ok(self.state.lock().await.messages.get(&id).cloned())
        })
    }

    fn get_messages_for_data<'a>(
        &'a self,
        data_id: Uuid,
        namespace: &'a str,
    ) -> BoxFuture<'a, StoreResult<Vec<Message>>> {
        Box::pin(async move {
            self.maybe_fail()?;
            let state = self.state.lock().await;
            let mut messages: Vec<Message> = state
                .messages
                .values()
                .filter(|m| {
                    m.namespace == namespace
                        && m.confirmed.is_none()
                        && m.data.contains(&data_id)
                })
                .cloned()
                .collect();
            messages.sort_by_key(|m| m.sequence);
            Ok(messages)
        })
    }

    fn get_message_refs(
        &self,
        filter: MessageRefFilter,
    ) -> BoxFuture<'_, StoreResult<Vec<MessageRef>>> {
        Box::pin(async move {
            self.maybe_fail()?;
            let state = self.state.lock().await;
            let mut refs: Vec<MessageRef> = state
                .messages
                .values()
                .filter(|m| {
                    m.namespace == filter.namespace
                        && m.context == filter.context
                        && m.group == filter.group
                        && filter.after_sequence.is_none_or(|s| m.sequence > s)
                        && (!filter.unconfirmed_only || m.confirmed.is_none())
                })
                .map(|m| MessageRef {
                    id: m.id,
                    sequence: m.sequence,
                })
                .collect();
            refs.sort_by_key(|r| r.sequence);
            if let Some(limit) = filter.limit {
                refs.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
            }
            Ok(refs)
        })
    }

    fn update_message(&self, id: Uuid, update: MessageUpdate) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            self.maybe_fail()?;
            let mut state = self.state.lock().await;
            if let Some(message) = state.messages.get_mut(&id) {
                if let Some(confirmed) = update.confirmed {
                    message.confirmed = Some(confirmed);
                }
            }
            Ok(())
        })
    }

    fn check_data_available<'a>(
        &'a self,
        message: &'a Message,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move {
            self.maybe_fail()?;
            let state = self.state.lock().await;
            Ok(message.data.iter().all(|d| state.data.contains(d)))
        })
    }

    fn get_blocked_by_context<'a>(
        &'a self,
        namespace: &'a str,
        context: &'a str,
        group: Option<Uuid>,
    ) -> BoxFuture<'a, StoreResult<Option<Blocked>>> {
        Box::pin(async move {
            self.maybe_fail()?;
            let state = self.state.lock().await;
            Ok(state
                .blocked
                .iter()
                .find(|b| b.namespace == namespace && b.context == context && b.group == group)
                .cloned())
        })
    }

    fn insert_blocked<'a>(&'a self, blocked: &'a Blocked) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.maybe_fail()?;
            let mut state = self.state.lock().await;
            if state.blocked.iter().any(|b| b.id == blocked.id) {
                return Err(StoreError::Duplicate(blocked.id));
            }
            if state.blocked.iter().any(|b| {
                b.namespace == blocked.namespace
                    && b.context == blocked.context
                    && b.group == blocked.group
            }) {
                return Err(StoreError::Database(format!(
                    "blocker already exists for context {}:{}",
                    blocked.namespace, blocked.context
                )));
            }
            state.blocked.push(blocked.clone());
            Ok(())
        })
    }

    fn update_blocked(&self, id: Uuid, update: BlockedUpdate) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            self.maybe_fail()?;
            let mut state = self.state.lock().await;
            if let Some(blocked) = state.blocked.iter_mut().find(|b| b.id == id) {
                blocked.message = update.message;
            }
            Ok(())
        })
    }

    fn delete_blocked(&self, id: Uuid) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            self.maybe_fail()?;
            let mut state = self.state.lock().await;
            state.blocked.retain(|b| b.id != id);
            Ok(())
        })
    }

    fn get_offset<'a>(
        &'a self,
        kind: OffsetKind,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<Offset>>> {
        Box::pin(async move {
            self.maybe_fail()?;
            let state = self.state.lock().await;
            Ok(state
                .offsets
                .get(&(kind, namespace.to_string(), name.to_string()))
                .map(|&current| Offset {
                    kind,
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    current,
                }))
        })
    }

    fn upsert_offset<'a>(&'a self, offset: &'a Offset) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.maybe_fail()?;
            let mut state = self.state.lock().await;
            state.offsets.insert(
                (
                    offset.kind,
                    offset.namespace.clone(),
                    offset.name.clone(),
                ),
                offset.current,
            );
            Ok(())
        })
    }

    fn run_as_group<'a>(
        &'a self,
        work: BoxFuture<'a, StoreResult<()>>,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            {
                let state = self.state.lock().await;
                let mut snapshot = self.snapshot.lock().await;
                if snapshot.is_some() {
                    return Err(StoreError::Transaction(
                        "transaction groups do not nest".to_string(),
                    ));
                }
                *snapshot = Some(state.clone());
            }
            let result = work.await;
            let snapshot = self.snapshot.lock().await.take();
            if result.is_err() {
                if let Some(snapshot) = snapshot {
                    *self.state.lock().await = snapshot;
                }
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use meshwork_core::types::EventKind;

    fn message(namespace: &str, context: &str, sequence: i64, data: Vec<Uuid>) -> Message {
        Message {
            id: Uuid::new_v4(),
            namespace: namespace.to_string(),
            context: context.to_string(),
            group: None,
            sequence,
            confirmed: None,
            data,
            created: Utc::now(),
        }
    }

    #[tokio::test]
    async fn sequences_are_assigned_in_insertion_order() {
        let store = InMemoryStore::new();
        for _ in 0..3 {
            store
                .insert_event(&Event::new(
                    EventKind::MessageSequencedBroadcast,
                    "ns1",
                    Uuid::new_v4(),
                ))
                .await
                .unwrap();
        }
        let events = store.events().await;
        let sequences: Vec<i64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(store.highest_event_sequence().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn duplicate_event_id_is_rejected() {
        let store = InMemoryStore::new();
        let event = Event::new(EventKind::DataArrivedBroadcast, "ns1", Uuid::new_v4());
        store.insert_event(&event).await.unwrap();
        let err = store.insert_event(&event).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(id) if id == event.id));
    }

    #[tokio::test]
    async fn failed_group_rolls_back_every_write() {
        let store = InMemoryStore::new();
        let msg = message("ns1", "ctx", 1, vec![]);
        store.insert_message(msg.clone()).await;

        let result = store
            .run_as_group(Box::pin(async {
                store
                    .insert_event(&Event::new(EventKind::MessageConfirmed, "ns1", msg.id))
                    .await?;
                store
                    .update_message(
                        msg.id,
                        MessageUpdate {
                            confirmed: Some(Utc::now()),
                        },
                    )
                    .await?;
                Err(StoreError::Database("boom".to_string()))
            }))
            .await;

        assert!(result.is_err());
        assert!(store.events().await.is_empty());
        assert!(store.message(msg.id).await.unwrap().confirmed.is_none());
    }

    #[tokio::test]
    async fn successful_group_commits() {
        let store = InMemoryStore::new();
        store
            .run_as_group(Box::pin(async {
                store
                    .insert_event(&Event::new(
                        EventKind::DataArrivedBroadcast,
                        "ns1",
                        Uuid::new_v4(),
                    ))
                    .await
            }))
            .await
            .unwrap();
        assert_eq!(store.events().await.len(), 1);
    }

    #[tokio::test]
    async fn fault_injection_counts_down() {
        let store = InMemoryStore::new();
        store.fail_next_ops(2);
        assert!(store.highest_event_sequence().await.is_err());
        assert!(store.highest_event_sequence().await.is_err());
        assert!(store.highest_event_sequence().await.is_ok());
    }

    #[tokio::test]
    async fn message_ref_filter_respects_context_and_sequence() {
        let store = InMemoryStore::new();
        let m1 = message("ns1", "ctx", 1, vec![]);
        let m2 = message("ns1", "ctx", 5, vec![]);
        let m3 = message("ns1", "other", 3, vec![]);
        for m in [&m1, &m2, &m3] {
            store.insert_message(m.clone()).await;
        }

        let refs = store
            .get_message_refs(MessageRefFilter {
                namespace: "ns1".to_string(),
                context: "ctx".to_string(),
                group: None,
                after_sequence: Some(1),
                unconfirmed_only: true,
                limit: Some(1),
            })
            .await
            .unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].id, m2.id);
    }
}
