use crate::compensation::{CompensationEntry, CompensationOutcome};
use crate::domain::{DomainState, StartParams, WorkflowKind};
use crate::journal::InstanceStatus;
use crate::payload::{Payload, PayloadError};
use crate::step::{StepError, StepName};
use crate::wait::{EventName, WaitDescriptor, WaitOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::{BTreeMap, BTreeSet};

/// Immutable facts pinned by the first event of the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartInfo {
    pub kind: WorkflowKind,
    pub params: StartParams,
    pub client_token: String,
}

/// The last fulfilled wait, kept until the next `TransitionApplied`
/// consumes it. Machines read it to decide the transition out of a
/// human-gated state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfilledWait {
    pub name: EventName,
    pub outcome: WaitOutcome,
}

/// The step whose failure is currently unhandled, cleared when a
/// transition is applied or the step later succeeds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedStep {
    pub step: StepName,
    pub error: StepError,
}

/// The fold of an instance's event log: everything the scheduler and the
/// domain machines need to decide the next action.
///
/// This is also the snapshot blob: a snapshot is nothing but a persisted
/// fold prefix, so losing every snapshot loses no information.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    pub version: u64,
    pub status: InstanceStatus,
    pub start: StartInfo,
    pub state: DomainState,
    /// Cached outputs of succeeded steps, keyed by step name.
    pub memo: BTreeMap<StepName, Payload>,
    /// Steps that have recorded a `StepStarted`.
    pub started_steps: BTreeSet<StepName>,
    /// The outstanding suspension, at most one.
    pub wait: Option<WaitDescriptor>,
    pub last_wait: Option<FulfilledWait>,
    /// Set when a sleep fired and no transition has consumed it yet.
    pub sleep_fired: bool,
    /// Reversal actions registered by succeeded steps, in push order.
    pub comp_stack: Vec<CompensationEntry>,
    pub comp_outcomes: Vec<CompensationOutcome>,
    pub abort_reason: Option<String>,
    pub last_error: Option<FailedStep>,
}

impl InstanceState {
    /// Fresh state for a just-started instance, before any further fold.
    pub fn new(start: StartInfo) -> Self {
        let state = DomainState::initial(start.kind);
        Self {
            version: 0,
            status: InstanceStatus::Runnable,
            start,
            state,
            memo: BTreeMap::new(),
            started_steps: BTreeSet::new(),
            wait: None,
            last_wait: None,
            sleep_fired: false,
            comp_stack: Vec::new(),
            comp_outcomes: Vec::new(),
            abort_reason: None,
            last_error: None,
        }
    }

    pub fn kind(&self) -> WorkflowKind {
        self.start.kind
    }

    /// Raw memoized output of a step, if it has succeeded.
    pub fn memo_output(&self, step: &StepName) -> Option<&Payload> {
        self.memo.get(step)
    }

    /// Typed memoized output. `Ok(None)` means the step has not succeeded
    /// yet; a decode failure means the log and the machine disagree about
    /// the output shape, which callers treat as fatal.
    pub fn step_output<T: DeserializeOwned>(
        &self,
        step: &StepName,
    ) -> Result<Option<T>, PayloadError> {
        match self.memo.get(step) {
            Some(payload) => payload.decode().map(Some),
            None => Ok(None),
        }
    }

    pub fn has_step(&self, step: &StepName) -> bool {
        self.memo.contains_key(step)
    }

    /// Outcome of the most recent fulfilled wait, if it was for `name`.
    pub fn last_wait_for(&self, name: &EventName) -> Option<&WaitOutcome> {
        match &self.last_wait {
            Some(fulfilled) if &fulfilled.name == name => Some(&fulfilled.outcome),
            _ => None,
        }
    }

    pub fn failed_step(&self) -> Option<&FailedStep> {
        self.last_error.as_ref()
    }
}

/// A persisted fold prefix, written every N events to bound replay cost.
/// Strictly derivative of the log; idempotent on (instance, version).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub state: InstanceState,
}

impl Snapshot {
    pub fn version(&self) -> u64 {
        self.state.version
    }
}
