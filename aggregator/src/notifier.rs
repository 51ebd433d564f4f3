//! Wake-up channel between event writers and the poller.

use tokio::sync::Notify;

/// A coalescing one-slot wake signal.
///
/// Anything that inserts events may call [`new_events`](Self::new_events) to
/// cut short the poller's idle wait. Signalling while a wake is already
/// pending is a no-op, and the poller consumes at most one wake per idle
/// wait. Losing a wake never loses correctness, because the next poll still
/// sees the new rows; it only affects latency.
#[derive(Debug, Default)]
pub struct EventNotifier {
    notify: Notify,
}

impl EventNotifier {
    /// Create a notifier with no wake pending.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal that new events were inserted. Coalesces with any pending wake.
    pub fn new_events(&self) {
        self.notify.notify_one();
    }

    /// Wait for a wake, consuming it.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wake_before_wait_is_delivered() {
        let notifier = EventNotifier::new();
        notifier.new_events();
        tokio::time::timeout(Duration::from_secs(1), notifier.wait())
            .await
            .expect("pending wake should be consumed immediately");
    }

    #[tokio::test]
    async fn wakes_coalesce_to_one() {
        let notifier = EventNotifier::new();
        notifier.new_events();
        notifier.new_events();
        notifier.new_events();
        tokio::time::timeout(Duration::from_secs(1), notifier.wait())
            .await
            .expect("first wait consumes the coalesced wake");
        // The second wait must block: all three signals collapsed into one.
        let second = tokio::time::timeout(Duration::from_millis(50), notifier.wait()).await;
        assert!(second.is_err());
    }
}
