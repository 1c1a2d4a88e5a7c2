use greenlight_types::{InstanceId, StepName};

/// Describes a specific event-log invariant violation.
///
/// Grouped by checker: structural (versioning, lifecycle bookends,
/// terminal finality), steps (at-most-once side effects), waits
/// (single outstanding suspension), compensation (LIFO reversal).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogViolation {
    /// Versions must form a contiguous 1-based sequence.
    NonContiguousVersion {
        index: usize,
        expected: u64,
        actual: u64,
    },
    /// The first event in every log must be `InstanceStarted`.
    MissingInstanceStarted { first_event: String },
    /// `InstanceStarted` may appear only once, at version 1.
    DuplicateInstanceStarted { version: u64 },
    /// At most one terminal event per log.
    MultipleTerminalEvents { first_at: u64, second_at: u64 },
    /// A terminal event must be the last entry.
    TerminalNotLast { terminal_version: u64, log_len: usize },

    /// `StepSucceeded` requires a preceding `StepStarted` for the step.
    SucceededWithoutStarted { step: StepName, version: u64 },
    /// A step name may succeed at most once per instance.
    DuplicateStepSuccess { step: StepName, version: u64 },
    /// `StepFailed` requires a preceding `StepStarted` for the step.
    FailedWithoutStarted { step: StepName, version: u64 },
    /// `StepRetrying` requires a preceding `StepStarted` for the step.
    RetryingWithoutStarted { step: StepName, version: u64 },
    /// No step events after the step has succeeded; replays must hit the
    /// memo instead.
    StepEventAfterSuccess {
        step: StepName,
        version: u64,
        offending_event: String,
    },

    /// A new wait or sleep opened while another was outstanding.
    OverlappingWait { version: u64, outstanding: String },
    /// `WaitFulfilled` without an outstanding event wait.
    FulfilledWithoutWait { name: String, version: u64 },
    /// `WaitFulfilled` names a different event than the outstanding wait.
    FulfilledNameMismatch {
        expected: String,
        actual: String,
        version: u64,
    },
    /// `SleepFired` without an outstanding sleep.
    SleepFiredWithoutSleep { version: u64 },

    /// A compensator ran for a step that never registered one.
    CompensationWithoutStep { step: StepName, version: u64 },
    /// Compensators must pop in reverse registration order.
    CompensationOutOfOrder {
        expected: StepName,
        actual: StepName,
        version: u64,
    },
    /// Compensation requires a preceding abort, step failure, or failure
    /// transition.
    CompensationWithoutFailure { version: u64 },
    /// Each registered compensator applies at most once.
    DuplicateCompensation { step: StepName, version: u64 },
}

impl std::fmt::Display for LogViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonContiguousVersion {
                index,
                expected,
                actual,
            } => write!(
                f,
                "non-contiguous version at index {index}: expected {expected}, got {actual}"
            ),
            Self::MissingInstanceStarted { first_event } => write!(
                f,
                "first event must be InstanceStarted, got {first_event}"
            ),
            Self::DuplicateInstanceStarted { version } => {
                write!(f, "second InstanceStarted at version {version}")
            }
            Self::MultipleTerminalEvents { first_at, second_at } => write!(
                f,
                "multiple terminal events at versions {first_at} and {second_at}"
            ),
            Self::TerminalNotLast {
                terminal_version,
                log_len,
            } => write!(
                f,
                "terminal event at version {terminal_version} is not last (log has {log_len} events)"
            ),
            Self::SucceededWithoutStarted { step, version } => write!(
                f,
                "StepSucceeded for '{step}' at version {version} without prior StepStarted"
            ),
            Self::DuplicateStepSuccess { step, version } => write!(
                f,
                "second StepSucceeded for '{step}' at version {version}"
            ),
            Self::FailedWithoutStarted { step, version } => write!(
                f,
                "StepFailed for '{step}' at version {version} without prior StepStarted"
            ),
            Self::RetryingWithoutStarted { step, version } => write!(
                f,
                "StepRetrying for '{step}' at version {version} without prior StepStarted"
            ),
            Self::StepEventAfterSuccess {
                step,
                version,
                offending_event,
            } => write!(
                f,
                "{offending_event} for '{step}' at version {version} after the step succeeded"
            ),
            Self::OverlappingWait {
                version,
                outstanding,
            } => write!(
                f,
                "wait opened at version {version} while {outstanding} is outstanding"
            ),
            Self::FulfilledWithoutWait { name, version } => write!(
                f,
                "WaitFulfilled for '{name}' at version {version} without an outstanding wait"
            ),
            Self::FulfilledNameMismatch {
                expected,
                actual,
                version,
            } => write!(
                f,
                "WaitFulfilled for '{actual}' at version {version}, but the outstanding wait is '{expected}'"
            ),
            Self::SleepFiredWithoutSleep { version } => {
                write!(f, "SleepFired at version {version} without an outstanding sleep")
            }
            Self::CompensationWithoutStep { step, version } => write!(
                f,
                "CompensationApplied for '{step}' at version {version}, but that step registered no compensator"
            ),
            Self::CompensationOutOfOrder {
                expected,
                actual,
                version,
            } => write!(
                f,
                "CompensationApplied for '{actual}' at version {version}, but the stack top is '{expected}'"
            ),
            Self::CompensationWithoutFailure { version } => write!(
                f,
                "CompensationApplied at version {version} without a preceding abort or failure"
            ),
            Self::DuplicateCompensation { step, version } => write!(
                f,
                "second CompensationApplied for '{step}' at version {version}"
            ),
        }
    }
}

/// Errors produced by the persistence traits.
///
/// IO errors are retriable; callers must not assume an IO-error append
/// did not persist; deterministic event ids make the retry detectable
/// as a duplicate.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("version conflict on {instance}: expected {expected}, found {actual}")]
    VersionConflict {
        instance: InstanceId,
        expected: u64,
        actual: u64,
    },
    #[error("unknown instance {0}")]
    UnknownInstance(InstanceId),
    #[error("storage io: {0}")]
    Io(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::VersionConflict { .. })
    }
}

/// Errors produced while folding a log into state.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    #[error("cannot rebuild from an empty log")]
    EmptyLog,
    #[error("log does not begin with InstanceStarted (got {first_event})")]
    MissingStart { first_event: String },
}
