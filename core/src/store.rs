//! The store trait the aggregator speaks to.
//!
//! The aggregator has no wire protocol of its own; every effect it has on the
//! world goes through [`Store`]. Two implementations exist:
//!
//! - `PostgresStore` (in `meshwork-postgres`): production implementation
//! - `InMemoryStore` (in `meshwork-testing`): fast, deterministic testing
//!
//! # Transactional groups
//!
//! [`Store::run_as_group`] executes a future inside a single transaction: all
//! reads and writes issued through the store while the group is open see a
//! consistent snapshot and commit atomically. An error returned from the
//! future rolls the whole group back. This is the aggregator's sole
//! crash-consistency mechanism: derived events, confirmations, blocker
//! mutations and the offset commit for a batch all ride the same group.
//!
//! # Dyn compatibility
//!
//! Methods return [`BoxFuture`] instead of using `async fn` so the trait can
//! be used as `Arc<dyn Store>`, the same shape the rest of the workspace
//! expects for injected dependencies.

use crate::types::{Blocked, Event, EventKind, Message, MessageRef, Offset, OffsetKind};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by store implementations.
///
/// Everything here is treated as a transient persistence failure by the
/// aggregator: the batch is rolled back and retried with backoff. No error
/// class is silently swallowed.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database connection or query error.
    #[error("Database error: {0}")]
    Database(String),

    /// Insert collided with an existing record id.
    #[error("Duplicate record: {0}")]
    Duplicate(Uuid),

    /// Transaction group could not be opened, committed or rolled back.
    #[error("Transaction error: {0}")]
    Transaction(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Ordered query over the event log.
///
/// All clauses are conjunctive; results are always ordered by sequence
/// ascending.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Only events referring to this message or data id.
    pub reference: Option<Uuid>,
    /// Only events of this kind.
    pub kind: Option<EventKind>,
    /// Only events with a sequence strictly greater than this.
    pub after_sequence: Option<i64>,
    /// Cap on the number of rows returned.
    pub limit: Option<i64>,
}

/// Query over message refs, used for successor lookup within a context.
///
/// Results are ordered by sequence ascending.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRefFilter {
    /// Namespace of the context.
    pub namespace: String,
    /// The context itself.
    pub context: String,
    /// Group of the context; `None` matches only the null group.
    pub group: Option<Uuid>,
    /// Only messages with a sequence strictly greater than this.
    pub after_sequence: Option<i64>,
    /// Only messages that have not been confirmed.
    pub unconfirmed_only: bool,
    /// Cap on the number of rows returned.
    pub limit: Option<i64>,
}

/// Partial update of a message. `None` fields are left untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageUpdate {
    /// Set the confirmation timestamp.
    pub confirmed: Option<DateTime<Utc>>,
}

/// Partial update of a blocked row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockedUpdate {
    /// Redirect the blocker to this message.
    pub message: Uuid,
}

/// Persistence operations required by the event aggregator.
pub trait Store: Send + Sync {
    /// Query the event log, ordered by sequence ascending.
    fn get_events(&self, filter: EventFilter) -> BoxFuture<'_, StoreResult<Vec<Event>>>;

    /// Insert a new event. The store assigns the sequence; the caller's
    /// `sequence` field is ignored. An id collision is an error.
    fn insert_event<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, StoreResult<()>>;

    /// The highest sequence currently in the event log, if any.
    fn highest_event_sequence(&self) -> BoxFuture<'_, StoreResult<Option<i64>>>;

    /// Fetch a message by id.
    fn get_message_by_id(&self, id: Uuid) -> BoxFuture<'_, StoreResult<Option<Message>>>;

    /// All unconfirmed messages in `namespace` referencing the data blob,
    /// ordered by sequence ascending.
    fn get_messages_for_data<'a>(
        &'a self,
        data_id: Uuid,
        namespace: &'a str,
    ) -> BoxFuture<'a, StoreResult<Vec<Message>>>;

    /// Lightweight message projection query; see [`MessageRefFilter`].
    fn get_message_refs(
        &self,
        filter: MessageRefFilter,
    ) -> BoxFuture<'_, StoreResult<Vec<MessageRef>>>;

    /// Partially update a message.
    fn update_message(&self, id: Uuid, update: MessageUpdate) -> BoxFuture<'_, StoreResult<()>>;

    /// Whether every data blob the message references is locally available.
    ///
    /// Returns an error only on persistence failure, never for missing data.
    fn check_data_available<'a>(&'a self, message: &'a Message)
        -> BoxFuture<'a, StoreResult<bool>>;

    /// Fetch the blocker of a context, if one exists.
    fn get_blocked_by_context<'a>(
        &'a self,
        namespace: &'a str,
        context: &'a str,
        group: Option<Uuid>,
    ) -> BoxFuture<'a, StoreResult<Option<Blocked>>>;

    /// Insert a new blocker. Colliding with an existing row for the same
    /// context is an error.
    fn insert_blocked<'a>(&'a self, blocked: &'a Blocked) -> BoxFuture<'a, StoreResult<()>>;

    /// Partially update a blocked row.
    fn update_blocked(&self, id: Uuid, update: BlockedUpdate) -> BoxFuture<'_, StoreResult<()>>;

    /// Delete a blocked row.
    fn delete_blocked(&self, id: Uuid) -> BoxFuture<'_, StoreResult<()>>;

    /// Fetch a durable cursor.
    fn get_offset<'a>(
        &'a self,
        kind: OffsetKind,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<Offset>>>;

    /// Insert or advance a durable cursor.
    fn upsert_offset<'a>(&'a self, offset: &'a Offset) -> BoxFuture<'a, StoreResult<()>>;

    /// Execute `work` inside a single transaction.
    ///
    /// Store calls made while the group is open are routed through the
    /// transaction. If `work` returns an error the transaction is rolled back
    /// and the error is returned; otherwise the transaction commits. Groups
    /// do not nest.
    fn run_as_group<'a>(
        &'a self,
        work: BoxFuture<'a, StoreResult<()>>,
    ) -> BoxFuture<'a, StoreResult<()>>;
}

impl EventFilter {
    /// Filter for events of one kind referring to one id.
    #[must_use]
    pub fn by_reference(reference: Uuid, kind: EventKind) -> Self {
        Self {
            reference: Some(reference),
            kind: Some(kind),
            ..Self::default()
        }
    }

    /// Filter for a poller batch: everything after `sequence`, up to `limit`
    /// rows.
    #[must_use]
    pub fn batch(after_sequence: i64, limit: i64) -> Self {
        Self {
            after_sequence: Some(after_sequence),
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Cap the number of rows returned.
    #[must_use]
    pub const fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn by_reference_sets_only_reference_and_kind() {
        let id = Uuid::new_v4();
        let filter = EventFilter::by_reference(id, EventKind::MessageSequencedBroadcast);
        assert_eq!(filter.reference, Some(id));
        assert_eq!(filter.kind, Some(EventKind::MessageSequencedBroadcast));
        assert_eq!(filter.after_sequence, None);
        assert_eq!(filter.limit, None);
    }

    #[test]
    fn batch_filter_sets_cursor_and_limit() {
        let filter = EventFilter::batch(41, 50);
        assert_eq!(filter.after_sequence, Some(41));
        assert_eq!(filter.limit, Some(50));
        assert_eq!(filter.reference, None);
    }
}
