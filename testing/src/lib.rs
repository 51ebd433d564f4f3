//! # Meshwork Testing
//!
//! Test utilities for the meshwork workspace, most importantly
//! [`InMemoryStore`]: a complete, deterministic implementation of the
//! [`Store`](meshwork_core::store::Store) trait backed by plain collections.
//!
//! The in-memory store keeps real transactional-group semantics (a group
//! snapshots the state up front and restores it if the work fails), so
//! rollback and replay behavior can be exercised without a database. It also
//! supports fault injection ([`InMemoryStore::fail_next_ops`]) to drive the
//! retry paths.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod store;

pub use store::InMemoryStore;
