//! The seam to the system-broadcast handler.
//!
//! Messages published into the reserved system namespace carry definitions
//! the service itself consumes. The aggregator dispatches them to an
//! in-process handler synchronously, inside the batch transaction, *before*
//! confirming the message: applications must never observe a confirmation
//! whose system side effects have not happened yet.

use crate::store::StoreResult;
use crate::types::Message;
use futures::future::BoxFuture;

/// Handler for messages in the system namespace.
///
/// Invoked inside the aggregator's batch transaction, immediately before the
/// message is confirmed. Implementations must surface only retryable errors:
/// a returned error rolls back the batch and the poller retries it verbatim,
/// so a deterministic failure would wedge the stream. Anything non-retryable
/// is a bug in the handler, not in the aggregator.
pub trait SystemBroadcastHandler: Send + Sync {
    /// Process a system-namespace message.
    fn handle_system_broadcast<'a>(
        &'a self,
        message: &'a Message,
    ) -> BoxFuture<'a, StoreResult<()>>;
}

/// A handler that accepts every system broadcast without doing anything.
///
/// Useful for compositions that do not process system definitions, and for
/// tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSystemBroadcastHandler;

impl SystemBroadcastHandler for NoopSystemBroadcastHandler {
    fn handle_system_broadcast<'a>(
        &'a self,
        _message: &'a Message,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async { Ok(()) })
    }
}
