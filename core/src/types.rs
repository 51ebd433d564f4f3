//! Persisted entities of the messaging service, as seen by the aggregator.
//!
//! The aggregator reads and writes these through the [`Store`](crate::store::Store)
//! trait. Messages and data are created by external ingestion; events are
//! created by ingestion *and* by the aggregator; blocked rows are owned by the
//! aggregator alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// The reserved namespace whose messages are dispatched to the in-process
/// system broadcast handler before confirmation.
pub const SYSTEM_NAMESPACE: &str = "mw_system";

/// Name of the durable offset owned by the event aggregator.
pub const AGGREGATOR_OFFSET_NAME: &str = "mw-aggregator";

/// The kind of an event in the ordered log.
///
/// The set the aggregator reacts to is closed; anything else decodes as
/// [`EventKind::Other`] and is ignored by dispatch. The derived kinds, those
/// the aggregator itself produces, are encoded as data via
/// [`EventKind::is_derived`] so the no-reprocessing rule stays auditable:
/// the aggregator must never react to a kind it emits, or a batch could feed
/// itself forever.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    /// A data blob referenced by one or more messages is now locally available.
    DataArrivedBroadcast,
    /// A message envelope has been committed and assigned its global sequence.
    MessageSequencedBroadcast,
    /// Emitted by the aggregator once every dependency of a message is
    /// satisfied and its context allows confirmation.
    MessageConfirmed,
    /// Emitted by the aggregator when a confirmation unblocks a successor
    /// message in the same context.
    MessagesUnblocked,
    /// Any kind this subsystem does not recognize; preserved losslessly.
    Other(String),
}

impl EventKind {
    /// The wire/database representation of this kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::DataArrivedBroadcast => "data-arrived-broadcast",
            Self::MessageSequencedBroadcast => "message-sequenced-broadcast",
            Self::MessageConfirmed => "message-confirmed",
            Self::MessagesUnblocked => "messages-unblocked",
            Self::Other(kind) => kind,
        }
    }

    /// Whether this kind is produced by the aggregator itself.
    ///
    /// Derived kinds are inert to aggregation: dispatch must treat them as
    /// no-ops.
    #[must_use]
    pub const fn is_derived(&self) -> bool {
        matches!(self, Self::MessageConfirmed | Self::MessagesUnblocked)
    }
}

impl From<&str> for EventKind {
    fn from(value: &str) -> Self {
        match value {
            "data-arrived-broadcast" => Self::DataArrivedBroadcast,
            "message-sequenced-broadcast" => Self::MessageSequencedBroadcast,
            "message-confirmed" => Self::MessageConfirmed,
            "messages-unblocked" => Self::MessagesUnblocked,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for EventKind {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entry in the totally ordered event log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    /// Unique id of the event itself.
    pub id: Uuid,
    /// Monotonic position in the log. Assigned by the store at insert time;
    /// zero until then.
    pub sequence: i64,
    /// What happened.
    pub kind: EventKind,
    /// Namespace the event belongs to.
    pub namespace: String,
    /// The message or data id this event refers to, depending on `kind`.
    pub reference: Uuid,
    /// When the event was created.
    pub created: DateTime<Utc>,
}

impl Event {
    /// Create a new event with a fresh id, ready for insertion.
    ///
    /// The sequence is left at zero; the store assigns the real one.
    #[must_use]
    pub fn new(kind: EventKind, namespace: impl Into<String>, reference: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            kind,
            namespace: namespace.into(),
            reference,
            created: Utc::now(),
        }
    }
}

/// A message published by a participant.
///
/// A message is confirmed at most once: `confirmed` moves monotonically from
/// `None` to a timestamp, and only the aggregator sets it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Unique message id.
    pub id: Uuid,
    /// Namespace the message was published into.
    pub namespace: String,
    /// Opaque partition key; messages sharing a context confirm in sequence
    /// order.
    pub context: String,
    /// Optional group the message belongs to. A `None` group is a distinct
    /// equivalence class for context blocking.
    pub group: Option<Uuid>,
    /// Sequence of the message's own sequenced event.
    pub sequence: i64,
    /// Set once every dependency is satisfied and the context allows it.
    pub confirmed: Option<DateTime<Utc>>,
    /// Ordered ids of the data blobs this message references.
    pub data: Vec<Uuid>,
    /// When the message was persisted.
    pub created: DateTime<Utc>,
}

/// Lightweight projection of a message, used for successor lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageRef {
    /// Message id.
    pub id: Uuid,
    /// Sequence of the message's sequenced event.
    pub sequence: i64,
}

/// The FIFO head of a blocked context.
///
/// At most one row exists per `(namespace, context, group)`; it names the
/// earliest uncomplete message holding the context closed. Rows are created,
/// redirected and deleted exclusively by the aggregator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blocked {
    /// Unique row id.
    pub id: Uuid,
    /// Namespace of the blocked context.
    pub namespace: String,
    /// The blocked context.
    pub context: String,
    /// Group of the blocked context, if any.
    pub group: Option<Uuid>,
    /// The message currently holding the context closed.
    pub message: Uuid,
    /// When the row was created.
    pub created: DateTime<Utc>,
}

impl Blocked {
    /// Create a new blocker for a context, pointing at `message`.
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        context: impl Into<String>,
        group: Option<Uuid>,
        message: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            namespace: namespace.into(),
            context: context.into(),
            group,
            message,
            created: Utc::now(),
        }
    }
}

/// What kind of consumer an offset belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetKind {
    /// The event aggregator's durable cursor.
    Aggregator,
}

impl OffsetKind {
    /// The wire/database representation of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Aggregator => "aggregator",
        }
    }
}

impl fmt::Display for OffsetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable cursor into the event log.
///
/// `current` is the sequence of the last event fully processed; delivery
/// resumes strictly after it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Offset {
    /// Consumer kind.
    pub kind: OffsetKind,
    /// Namespace the offset is stored under.
    pub namespace: String,
    /// Name of the consumer owning the cursor.
    pub name: String,
    /// Sequence of the last fully processed event.
    pub current: i64,
}

/// Where a poller starts when its offset does not exist yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirstEvent {
    /// Start at the beginning of the log.
    Oldest,
    /// Start after the newest event currently in the log.
    Newest,
    /// Start delivery at this exact sequence.
    Sequence(i64),
}

impl Default for FirstEvent {
    fn default() -> Self {
        Self::Oldest
    }
}

/// Error parsing a [`FirstEvent`] from configuration.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid first-event value: {0}")]
pub struct FirstEventParseError(String);

impl FromStr for FirstEvent {
    type Err = FirstEventParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oldest" => Ok(Self::Oldest),
            "newest" => Ok(Self::Newest),
            other => other
                .parse::<i64>()
                .map(Self::Sequence)
                .map_err(|_| FirstEventParseError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_round_trips_through_strings() {
        for kind in [
            EventKind::DataArrivedBroadcast,
            EventKind::MessageSequencedBroadcast,
            EventKind::MessageConfirmed,
            EventKind::MessagesUnblocked,
        ] {
            assert_eq!(EventKind::from(kind.as_str()), kind);
        }
    }

    #[test]
    fn unknown_event_kind_is_preserved() {
        let kind = EventKind::from("transfer-settled");
        assert_eq!(kind, EventKind::Other("transfer-settled".to_string()));
        assert_eq!(kind.as_str(), "transfer-settled");
        assert!(!kind.is_derived());
    }

    #[test]
    fn derived_kinds_are_exactly_the_aggregator_outputs() {
        assert!(EventKind::MessageConfirmed.is_derived());
        assert!(EventKind::MessagesUnblocked.is_derived());
        assert!(!EventKind::DataArrivedBroadcast.is_derived());
        assert!(!EventKind::MessageSequencedBroadcast.is_derived());
    }

    #[test]
    fn event_kind_serde_uses_kebab_case_strings() {
        let json = serde_json::to_string(&EventKind::DataArrivedBroadcast).unwrap();
        assert_eq!(json, "\"data-arrived-broadcast\"");
        let back: EventKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EventKind::DataArrivedBroadcast);
    }

    #[test]
    fn first_event_parses_all_forms() {
        assert_eq!("oldest".parse::<FirstEvent>().unwrap(), FirstEvent::Oldest);
        assert_eq!("newest".parse::<FirstEvent>().unwrap(), FirstEvent::Newest);
        assert_eq!(
            "1234".parse::<FirstEvent>().unwrap(),
            FirstEvent::Sequence(1234)
        );
        assert!("tomorrow".parse::<FirstEvent>().is_err());
    }

    #[test]
    fn new_event_has_no_sequence_yet() {
        let event = Event::new(EventKind::MessageConfirmed, "ns1", Uuid::new_v4());
        assert_eq!(event.sequence, 0);
    }
}
