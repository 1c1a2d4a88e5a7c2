//! Compensation invariants.
//!
//! Reversal actions pop strictly LIFO off the persisted stack, only after
//! the log shows a reason to compensate (abort, step failure, or a
//! failure transition), and at most once per registered step.

use super::LogCheck;
use crate::error::LogViolation;
use greenlight_types::{EventRecord, EventType};

pub(crate) fn check(state: &LogCheck, record: &EventRecord) -> Result<(), LogViolation> {
    let step = match &record.event {
        EventType::CompensationApplied { step, .. } => step,
        _ => return Ok(()),
    };

    if !state.failure_seen {
        return Err(LogViolation::CompensationWithoutFailure {
            version: record.version,
        });
    }

    if state.comp_applied.contains(step) {
        return Err(LogViolation::DuplicateCompensation {
            step: step.clone(),
            version: record.version,
        });
    }

    match state.comp_stack.last() {
        Some(top) if top == step => Ok(()),
        Some(top) => Err(LogViolation::CompensationOutOfOrder {
            expected: top.clone(),
            actual: step.clone(),
            version: record.version,
        }),
        None => Err(LogViolation::CompensationWithoutStep {
            step: step.clone(),
            version: record.version,
        }),
    }
}
