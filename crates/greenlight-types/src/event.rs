use crate::compensation::{CompensationOp, CompensationOutcome};
use crate::domain::{DomainState, StartParams, WorkflowKind};
use crate::payload::Payload;
use crate::step::{StepError, StepName};
use crate::wait::{EventFilter, EventName, WaitOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All journal event types, grouped by category.
///
/// Extensible: new side-effect flavors are expressed as new step names,
/// not new event types. Every step shares the same Started -> Succeeded /
/// Failed structure so memoization and replay stay uniform.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    // ── Lifecycle ──
    /// Always the first event. Pins the kind, immutable creation
    /// parameters, and the idempotency token the instance id was derived
    /// from.
    InstanceStarted {
        kind: WorkflowKind,
        params: StartParams,
        client_token: String,
    },
    /// The workflow concluded (terminal). The domain state at conclusion
    /// may be any non-failure terminal: Completed, Rejected, Expired,
    /// Withdrawn.
    InstanceCompleted { final_state: DomainState },
    /// The workflow halted after compensation (terminal).
    InstanceFailed {
        error: StepError,
        compensation: Vec<CompensationOutcome>,
    },
    /// External abort arrived. Observed at the next advance, which drains
    /// the compensation stack.
    AbortRequested { reason: String },

    // ── Steps (at-most-once side effects) ──
    /// Body execution began. Appended once per step; retries stay inside.
    StepStarted { step: StepName, attempt: u32 },
    /// Transient failure, will retry after backoff.
    StepRetrying {
        step: StepName,
        failed_attempt: u32,
        error: StepError,
        retry_at: DateTime<Utc>,
    },
    /// Step output, cached for replay. A compensation op registered at
    /// call time is persisted here so the stack survives restarts.
    StepSucceeded {
        step: StepName,
        output: Payload,
        compensation: Option<CompensationOp>,
    },
    /// Retries exhausted or the failure was not retryable.
    StepFailed { step: StepName, error: StepError },

    // ── Waits and sleeps (durable suspension) ──
    /// The instance blocked on a named external event.
    WaitStarted {
        name: EventName,
        filter: Option<EventFilter>,
        deadline: Option<DateTime<Utc>>,
    },
    /// The wait resolved, with a matching message or by deadline.
    WaitFulfilled { name: EventName, outcome: WaitOutcome },
    /// The instance blocked until an absolute wake time.
    SleepStarted { until: DateTime<Utc> },
    /// The wake time passed.
    SleepFired,

    // ── Transitions ──
    /// The domain machine moved between states. Carries the full target
    /// state including its data.
    TransitionApplied { from: DomainState, to: DomainState },

    // ── External deliveries ──
    /// An external message was durably accepted for this instance.
    /// Consumption is recorded separately by `WaitFulfilled`.
    ExternalEvent {
        name: EventName,
        payload: Payload,
        received_at: DateTime<Utc>,
    },

    // ── Compensation ──
    /// One compensator popped off the stack and executed.
    CompensationApplied {
        step: StepName,
        outcome: CompensationOutcome,
    },
}

impl EventType {
    /// The variant name as a static string for error messages and logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::InstanceStarted { .. } => "InstanceStarted",
            Self::InstanceCompleted { .. } => "InstanceCompleted",
            Self::InstanceFailed { .. } => "InstanceFailed",
            Self::AbortRequested { .. } => "AbortRequested",
            Self::StepStarted { .. } => "StepStarted",
            Self::StepRetrying { .. } => "StepRetrying",
            Self::StepSucceeded { .. } => "StepSucceeded",
            Self::StepFailed { .. } => "StepFailed",
            Self::WaitStarted { .. } => "WaitStarted",
            Self::WaitFulfilled { .. } => "WaitFulfilled",
            Self::SleepStarted { .. } => "SleepStarted",
            Self::SleepFired => "SleepFired",
            Self::TransitionApplied { .. } => "TransitionApplied",
            Self::ExternalEvent { .. } => "ExternalEvent",
            Self::CompensationApplied { .. } => "CompensationApplied",
        }
    }

    /// Whether this event seals the log (Completed or Failed).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InstanceCompleted { .. } | Self::InstanceFailed { .. }
        )
    }
}
