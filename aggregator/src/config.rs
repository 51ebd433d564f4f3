//! Aggregator configuration, loaded from environment variables with
//! sensible defaults.

use crate::retry::RetryPolicy;
use meshwork_core::types::FirstEvent;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Tuning knobs for the event aggregator and its poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Maximum number of events per batch.
    pub batch_size: usize,
    /// How long to wait for more rows when a fresh batch under-fills.
    /// Zero disables the coalescing wait.
    pub batch_timeout: Duration,
    /// Idle wait when the log is empty, cut short by notifier wakes.
    pub poll_timeout: Duration,
    /// Delay before the first retry of a failed batch.
    pub retry_initial_delay: Duration,
    /// Cap on the retry delay.
    pub retry_max_delay: Duration,
    /// Backoff multiplier per consecutive failure.
    pub retry_factor: f64,
    /// Where to start when no offset exists yet.
    pub first_event: FirstEvent,
    /// Attempts for the initial offset load before startup is abandoned.
    pub startup_attempts: u32,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_timeout: Duration::from_millis(250),
            poll_timeout: Duration::from_secs(30),
            retry_initial_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(30),
            retry_factor: 2.0,
            first_event: FirstEvent::Oldest,
            startup_attempts: 5,
        }
    }
}

impl AggregatorConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    ///
    /// Recognized variables: `EVENT_AGGREGATOR_BATCH_SIZE`,
    /// `EVENT_AGGREGATOR_BATCH_TIMEOUT_MS`, `EVENT_AGGREGATOR_POLL_TIMEOUT_MS`,
    /// `EVENT_AGGREGATOR_RETRY_INITIAL_DELAY_MS`,
    /// `EVENT_AGGREGATOR_RETRY_MAX_DELAY_MS`, `EVENT_AGGREGATOR_RETRY_FACTOR`,
    /// `EVENT_AGGREGATOR_FIRST_EVENT` (`oldest`, `newest`, or a sequence
    /// number), `ORCHESTRATOR_STARTUP_ATTEMPTS`.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: parsed("EVENT_AGGREGATOR_BATCH_SIZE").unwrap_or(defaults.batch_size),
            batch_timeout: parsed("EVENT_AGGREGATOR_BATCH_TIMEOUT_MS")
                .map_or(defaults.batch_timeout, Duration::from_millis),
            poll_timeout: parsed("EVENT_AGGREGATOR_POLL_TIMEOUT_MS")
                .map_or(defaults.poll_timeout, Duration::from_millis),
            retry_initial_delay: parsed("EVENT_AGGREGATOR_RETRY_INITIAL_DELAY_MS")
                .map_or(defaults.retry_initial_delay, Duration::from_millis),
            retry_max_delay: parsed("EVENT_AGGREGATOR_RETRY_MAX_DELAY_MS")
                .map_or(defaults.retry_max_delay, Duration::from_millis),
            retry_factor: parsed("EVENT_AGGREGATOR_RETRY_FACTOR").unwrap_or(defaults.retry_factor),
            first_event: parsed("EVENT_AGGREGATOR_FIRST_EVENT").unwrap_or(defaults.first_event),
            startup_attempts: parsed("ORCHESTRATOR_STARTUP_ATTEMPTS")
                .unwrap_or(defaults.startup_attempts),
        }
    }

    /// The retry schedule for failed batches.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_initial_delay,
            self.retry_max_delay,
            self.retry_factor,
        )
    }
}

fn parsed<T: std::str::FromStr>(var: &str) -> Option<T> {
    env::var(var).ok().and_then(|s| s.parse().ok())
}
