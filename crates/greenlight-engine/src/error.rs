use greenlight_journal::{LogViolation, ReplayError, StoreError};
use greenlight_types::{InstanceId, WorkflowKind};

/// Errors surfaced by the engine's ingress operations and the scheduler.
///
/// Step-level failures never appear here directly: transient ones are
/// retried inside the executor, domain ones become transitions, and
/// fatal ones become an `InstanceFailed` terminal with the error recorded
/// in the log.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Start-parameter validation failed. No instance was created.
    #[error("validation: {0}")]
    Validation(String),

    #[error("unknown instance {0}")]
    UnknownInstance(InstanceId),

    /// The registry has no (from → to) entry for this kind.
    #[error("illegal transition for {kind}: {from} -> {to}")]
    IllegalTransition {
        kind: WorkflowKind,
        from: &'static str,
        to: &'static str,
    },

    /// The machine produced an action inconsistent with the log (wrong
    /// kind, undecodable memo output, unexpected wait outcome). The log
    /// and the deployed machine version disagree; the instance halts.
    #[error("corrupted instance state: {0}")]
    Corrupted(String),

    /// Appending would violate a log invariant.
    #[error("log invariant: {0}")]
    LogInvariant(LogViolation),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Replay(#[from] ReplayError),
}

impl EngineError {
    /// Whether retrying the whole advance might help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_retryable())
    }
}
