//! # Meshwork Core
//!
//! Core types and store abstractions for meshwork, a multi-party messaging
//! and event-distribution service.
//!
//! Participants publish messages whose data blobs may arrive asynchronously
//! and out of order relative to the message envelopes themselves. Everything
//! is persisted, and a totally ordered event log is derived from the inserts.
//! The aggregator (in `meshwork-aggregator`) consumes that log, joins
//! "data arrived" and "message sequenced" signals per message, enforces
//! per-context in-order confirmation, and emits derived events back into the
//! same log.
//!
//! This crate provides:
//!
//! - [`types`]: the persisted entities ([`Event`](types::Event),
//!   [`Message`](types::Message), [`Blocked`](types::Blocked),
//!   [`Offset`](types::Offset)) and their supporting enums
//! - [`store`]: the [`Store`](store::Store) trait every persistence backend
//!   implements, plus typed filters and updates
//! - [`system`]: the [`SystemBroadcastHandler`](system::SystemBroadcastHandler)
//!   seam for in-process handling of system-namespace messages

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod store;
pub mod system;
pub mod types;

pub use store::{
    BlockedUpdate, EventFilter, MessageRefFilter, MessageUpdate, Store, StoreError, StoreResult,
};
pub use system::{NoopSystemBroadcastHandler, SystemBroadcastHandler};
pub use types::{
    Blocked, Event, EventKind, FirstEvent, Message, MessageRef, Offset, OffsetKind,
    AGGREGATOR_OFFSET_NAME, SYSTEM_NAMESPACE,
};
