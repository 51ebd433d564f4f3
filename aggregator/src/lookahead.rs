//! Per-batch lookahead index.
//!
//! Built fresh for every batch, the index maps each message or data
//! reference to the events in the batch that mention it. The aggregator uses
//! it to suppress redundant work: when a `data-arrived-broadcast` is about to
//! drive a completion check that an upcoming `message-sequenced-broadcast`
//! in the same batch will drive anyway, or when an unblock would emit an
//! event for a successor the batch is already going to touch.
//!
//! Skipping is correctness-preserving only because every skipped action is
//! guaranteed to be performed by that later event in the same batch. The
//! aggregator removes the event currently in hand before consulting the
//! index, so answers are always about *upcoming* events.

use meshwork_core::types::{Event, EventKind};
use std::collections::HashMap;
use uuid::Uuid;

/// Index of the current batch's events by the reference they carry.
#[derive(Debug, Default)]
pub struct Lookahead {
    by_reference: HashMap<Uuid, Vec<(Uuid, EventKind)>>,
}

impl Lookahead {
    /// Build the index over a batch.
    #[must_use]
    pub fn build(events: &[Event]) -> Self {
        let mut by_reference: HashMap<Uuid, Vec<(Uuid, EventKind)>> = HashMap::new();
        for event in events {
            by_reference
                .entry(event.reference)
                .or_default()
                .push((event.id, event.kind.clone()));
        }
        Self { by_reference }
    }

    /// Whether any remaining event for `reference` has a kind in `kinds`.
    #[must_use]
    pub fn has_any_of(&self, reference: Uuid, kinds: &[EventKind]) -> bool {
        self.by_reference
            .get(&reference)
            .is_some_and(|events| events.iter().any(|(_, kind)| kinds.contains(kind)))
    }

    /// Remove the event with the given id; returns whether it was present.
    pub fn remove(&mut self, event_id: Uuid) -> bool {
        for events in self.by_reference.values_mut() {
            if let Some(pos) = events.iter().position(|(id, _)| *id == event_id) {
                events.remove(pos);
                return true;
            }
        }
        false
    }
}
