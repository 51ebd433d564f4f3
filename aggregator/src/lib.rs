//! # Meshwork Event Aggregator
//!
//! The aggregator is the subsystem that turns meshwork's persisted,
//! monotonically sequenced event log into confirmed messages. It correlates
//! "data arrived" and "message sequenced" events by the message they refer
//! to, enforces per-context in-order confirmation through blocked-context
//! rows, and emits derived `message-confirmed` and `messages-unblocked`
//! events back into the same log.
//!
//! # Pipeline
//!
//! ```text
//! ┌──────────────┐  wake   ┌─────────────┐  batch   ┌──────────────┐
//! │EventNotifier │ ──────► │ EventPoller │ ───────► │  Aggregator  │
//! └──────────────┘         └─────────────┘          └──────┬───────┘
//!        ▲                        │                        │
//!        │ new events             │ offset resume          │ one transaction:
//!        │ inserted               ▼                        │ confirmations,
//! ┌──────┴───────────────────────────────┐                 │ blocker moves,
//! │                Store                 │ ◄───────────────┘ derived events,
//! └──────────────────────────────────────┘                   offset commit
//! ```
//!
//! - [`EventNotifier`]: coalescing one-slot wake channel between event
//!   writers and the poller. Purely a latency optimization.
//! - [`EventPoller`]: reads the log in bounded batches from a durable
//!   offset, retries failed batches verbatim with capped exponential
//!   backoff, and hands each batch to the handler.
//! - [`Aggregator`]: the handler. Processes each batch inside one
//!   transactional group, using a per-batch [`lookahead`] index to skip work
//!   an upcoming event in the same batch will redo anyway.
//!
//! Exactly one aggregator instance runs per process and per offset name;
//! deployments enforce the singleton externally.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use meshwork_aggregator::{Aggregator, AggregatorConfig, EventNotifier};
//! use meshwork_core::system::NoopSystemBroadcastHandler;
//!
//! let config = AggregatorConfig::from_env();
//! let notifier = Arc::new(EventNotifier::new());
//! let aggregator = Arc::new(Aggregator::new(store, Arc::new(NoopSystemBroadcastHandler)));
//! let (poller, shutdown) = aggregator.poller(&config, Arc::clone(&notifier));
//!
//! let running = tokio::spawn(poller.run());
//! // ... on shutdown:
//! shutdown.send(true).ok();
//! running.await??;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod aggregator;
pub mod config;
pub mod lookahead;
pub mod notifier;
pub mod poller;
pub mod retry;

pub use aggregator::Aggregator;
pub use config::AggregatorConfig;
pub use notifier::EventNotifier;
pub use poller::{EventHandler, EventPoller, EventPollerConfig, PollerMonitor};
pub use retry::RetryPolicy;
