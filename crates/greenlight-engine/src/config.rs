use chrono::Duration;
use greenlight_types::RetryPolicy;

/// Engine tuning knobs. Built fluently:
///
/// ```
/// use greenlight_engine::EngineConfig;
///
/// let config = EngineConfig::default()
///     .snapshot_interval(25)
///     .max_append_retries(5);
/// ```
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Write a snapshot after this many committed events.
    pub snapshot_interval: u64,
    /// How long unmatched mailbox messages are kept before sweeps drop
    /// them.
    pub mailbox_retention: Duration,
    /// Retry policy applied to steps that do not specify their own.
    pub default_retry: RetryPolicy,
    /// How many times an advance retries after a version conflict before
    /// giving up on the cycle (the instance stays runnable).
    pub max_append_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 50,
            mailbox_retention: Duration::days(30),
            default_retry: RetryPolicy::standard(),
            max_append_retries: 3,
        }
    }
}

impl EngineConfig {
    pub fn snapshot_interval(mut self, every_n_events: u64) -> Self {
        self.snapshot_interval = every_n_events.max(1);
        self
    }

    pub fn mailbox_retention(mut self, retention: Duration) -> Self {
        self.mailbox_retention = retention;
        self
    }

    pub fn default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    pub fn max_append_retries(mut self, retries: u32) -> Self {
        self.max_append_retries = retries;
        self
    }
}
