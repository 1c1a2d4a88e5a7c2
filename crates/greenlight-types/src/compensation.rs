use crate::step::{StepError, StepName};
use serde::{Deserialize, Serialize};

/// A reversal action registered by a forward step.
///
/// Ops are plain data referencing earlier steps by name: the intent or
/// envelope id a compensator needs is read from the original step's
/// memoized output at execution time, never held as a live handle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompensationOp {
    /// Refund a payment hold. `intent_step` names the step whose output
    /// carries the `intent_id` field.
    RefundPayment { intent_step: StepName },
    /// Void a signature envelope. `envelope_step` names the step whose
    /// output carries the `envelope_id` field.
    VoidEnvelope { envelope_step: StepName },
    /// Revoke a pitch-access grant.
    RevokePitchAccess { pitch_id: String, party_id: String },
    /// Release a pitch exclusivity window and promote the earliest
    /// waitlisted deal.
    ReleaseExclusivity { pitch_id: String },
    /// Mark a provisional deal or NDA row cancelled.
    CancelDealRecord { deal_id: String },
}

/// One entry of the persisted compensation stack, pushed when its step
/// succeeds and popped (LIFO) during a compensation run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationEntry {
    pub step: StepName,
    pub op: CompensationOp,
}

/// Result of executing one compensator. Failures are recorded and do not
/// block further pops.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationOutcome {
    pub step: StepName,
    pub result: Result<(), StepError>,
}

impl CompensationOutcome {
    pub fn succeeded(step: StepName) -> Self {
        Self {
            step,
            result: Ok(()),
        }
    }

    pub fn failed(step: StepName, error: StepError) -> Self {
        Self {
            step,
            result: Err(error),
        }
    }
}
