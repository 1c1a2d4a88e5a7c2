//! Step invariants.
//!
//! A step is an at-most-once side effect: its lifecycle events must
//! appear in Started → Retrying* → Succeeded/Failed order, a name may
//! succeed at most once per instance, and no step event may follow the
//! success; replays consult the memo instead of re-executing.

use super::LogCheck;
use crate::error::LogViolation;
use greenlight_types::{EventRecord, EventType, StepName};

pub(crate) fn check(state: &LogCheck, record: &EventRecord) -> Result<(), LogViolation> {
    let (step, requires_started): (&StepName, bool) = match &record.event {
        EventType::StepStarted { step, .. } => (step, false),
        EventType::StepRetrying { step, .. } => (step, true),
        EventType::StepSucceeded { step, .. } => (step, true),
        EventType::StepFailed { step, .. } => (step, true),
        _ => return Ok(()),
    };

    // Nothing may follow a success for the same name.
    if state.succeeded_steps.contains(step) {
        if matches!(record.event, EventType::StepSucceeded { .. }) {
            return Err(LogViolation::DuplicateStepSuccess {
                step: step.clone(),
                version: record.version,
            });
        }
        return Err(LogViolation::StepEventAfterSuccess {
            step: step.clone(),
            version: record.version,
            offending_event: record.event.name().to_string(),
        });
    }

    if requires_started && !state.started_steps.contains(step) {
        return Err(match &record.event {
            EventType::StepRetrying { .. } => LogViolation::RetryingWithoutStarted {
                step: step.clone(),
                version: record.version,
            },
            EventType::StepFailed { .. } => LogViolation::FailedWithoutStarted {
                step: step.clone(),
                version: record.version,
            },
            _ => LogViolation::SucceededWithoutStarted {
                step: step.clone(),
                version: record.version,
            },
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::record;
    use super::*;
    use greenlight_types::{Payload, StepError};
    use std::collections::HashSet;

    fn step() -> StepName {
        StepName::new("hold-funds")
    }

    fn with_started() -> LogCheck {
        LogCheck {
            len: 2,
            started: true,
            started_steps: HashSet::from([step()]),
            ..Default::default()
        }
    }

    fn with_succeeded() -> LogCheck {
        LogCheck {
            len: 3,
            started: true,
            started_steps: HashSet::from([step()]),
            succeeded_steps: HashSet::from([step()]),
            ..Default::default()
        }
    }

    fn succeeded_event() -> EventType {
        EventType::StepSucceeded {
            step: step(),
            output: Payload::null(),
            compensation: None,
        }
    }

    #[test]
    fn succeeded_without_started_is_rejected() {
        let state = LogCheck {
            len: 1,
            started: true,
            ..Default::default()
        };
        let err = check(&state, &record(2, succeeded_event())).unwrap_err();
        assert_eq!(
            err,
            LogViolation::SucceededWithoutStarted {
                step: step(),
                version: 2,
            }
        );
    }

    #[test]
    fn second_success_is_rejected() {
        let err = check(&with_succeeded(), &record(4, succeeded_event())).unwrap_err();
        assert_eq!(
            err,
            LogViolation::DuplicateStepSuccess {
                step: step(),
                version: 4,
            }
        );
    }

    #[test]
    fn started_after_success_is_rejected() {
        let err = check(
            &with_succeeded(),
            &record(
                4,
                EventType::StepStarted {
                    step: step(),
                    attempt: 1,
                },
            ),
        )
        .unwrap_err();
        assert_eq!(
            err,
            LogViolation::StepEventAfterSuccess {
                step: step(),
                version: 4,
                offending_event: "StepStarted".to_string(),
            }
        );
    }

    #[test]
    fn retrying_and_failed_require_started() {
        let state = LogCheck {
            len: 1,
            started: true,
            ..Default::default()
        };
        let retrying = EventType::StepRetrying {
            step: step(),
            failed_attempt: 1,
            error: StepError::transient("503"),
            retry_at: chrono::Utc::now(),
        };
        assert!(matches!(
            check(&state, &record(2, retrying)).unwrap_err(),
            LogViolation::RetryingWithoutStarted { .. }
        ));

        let failed = EventType::StepFailed {
            step: step(),
            error: StepError::fatal("boom"),
        };
        assert!(matches!(
            check(&state, &record(2, failed)).unwrap_err(),
            LogViolation::FailedWithoutStarted { .. }
        ));
    }

    #[test]
    fn ordered_lifecycle_passes() {
        let state = with_started();
        assert!(check(&state, &record(3, succeeded_event())).is_ok());

        let failed = EventType::StepFailed {
            step: step(),
            error: StepError::domain("not accredited"),
        };
        assert!(check(&state, &record(3, failed)).is_ok());
    }

    #[test]
    fn other_step_names_are_unaffected() {
        let other = EventType::StepStarted {
            step: StepName::new("release-funds"),
            attempt: 1,
        };
        assert!(check(&with_succeeded(), &record(4, other)).is_ok());
    }
}
