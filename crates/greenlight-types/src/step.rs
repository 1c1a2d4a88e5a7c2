use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Prefix for compensator step names. `refund` compensating `hold-funds`
/// runs as the step `compensate:hold-funds`.
pub const COMPENSATE_PREFIX: &str = "compensate:";

/// Names one side-effecting step within an instance.
///
/// Step names must be unique per instance and deterministic across
/// replays, since the memo is keyed by them.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepName(String);

impl StepName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name under which this step's compensator executes.
    pub fn compensation(&self) -> StepName {
        Self(format!("{COMPENSATE_PREFIX}{}", self.0))
    }

    pub fn is_compensation(&self) -> bool {
        self.0.starts_with(COMPENSATE_PREFIX)
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Canonical failure category. Drives retry policy and the scheduler's
/// routing of a failed step:
///
/// - `Transient` and `Timeout` are retried by the step executor and never
///   escape it short of exhaustion.
/// - `Domain` propagates to the state machine, which maps it to a
///   transition (usually a terminal reject).
/// - `Fatal` escapes to the scheduler, which compensates and halts the
///   instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    Transient,
    Domain,
    Timeout,
    Fatal,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Timeout)
    }
}

/// Structured payload for step failures.
///
/// Stable shape that is easy to classify (`class`) for retry decisions,
/// render (`message`) for user-facing summaries, and enrich (`detail`)
/// with low-level diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub class: ErrorClass,
    pub message: String,
    /// Optional diagnostic detail. Prefer concise, actionable context;
    /// omit when no extra detail exists.
    pub detail: Option<String>,
}

impl StepError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            detail: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    pub fn domain(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Domain, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Timeout, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Fatal, message)
    }

    /// Adds or replaces the diagnostic detail. Last value wins.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.class, self.message)?;
        if let Some(ref detail) = self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

impl std::error::Error for StepError {}

/// Retry behavior for one step.
///
/// Backoff for attempt n (1-based) is `min(max_delay, initial × multiplierⁿ⁻¹)`,
/// with optional ±25% uniform jitter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl RetryPolicy {
    /// Single attempt, no backoff. For steps whose failures are always
    /// routed to the machine (pure validation, local writes).
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Default for external-provider calls.
    pub fn standard() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Delay to sleep after `failed_attempt` (1-based) before retrying.
    pub fn delay_before(&self, failed_attempt: u32) -> Duration {
        let exp = failed_attempt.saturating_sub(1).min(63);
        let raw = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());
        if !self.jitter {
            return Duration::from_secs_f64(capped.max(0.0));
        }
        let factor = 0.75 + rand::random::<f64>() * 0.5;
        Duration::from_secs_f64((capped * factor).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compensation_name_is_prefixed() {
        let step = StepName::new("hold-funds");
        assert_eq!(step.compensation().as_str(), "compensate:hold-funds");
        assert!(!step.is_compensation());
        assert!(step.compensation().is_compensation());
    }

    #[test]
    fn retryable_classes() {
        assert!(ErrorClass::Transient.is_retryable());
        assert!(ErrorClass::Timeout.is_retryable());
        assert!(!ErrorClass::Domain.is_retryable());
        assert!(!ErrorClass::Fatal.is_retryable());
    }

    #[test]
    fn step_error_display_includes_detail() {
        let err = StepError::transient("provider 503").with_detail("attempt 2");
        assert_eq!(err.to_string(), "Transient: provider 503 (attempt 2)");
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(policy.delay_before(1), Duration::from_secs(1));
        assert_eq!(policy.delay_before(2), Duration::from_secs(2));
        assert_eq!(policy.delay_before(3), Duration::from_secs(4));
        assert_eq!(policy.delay_before(4), Duration::from_secs(8));
        assert_eq!(policy.delay_before(5), Duration::from_secs(8));
    }

    #[test]
    fn jitter_stays_within_quarter_band() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::standard()
        };
        for _ in 0..100 {
            let d = policy.delay_before(1).as_secs_f64();
            let base = policy.initial_delay.as_secs_f64();
            assert!(d >= base * 0.75 - f64::EPSILON);
            assert!(d <= base * 1.25 + f64::EPSILON);
        }
    }
}
