//! Wait invariants.
//!
//! At most one suspension (event wait or sleep) may be outstanding per
//! instance. Fulfillment must match the outstanding wait by kind and,
//! for event waits, by name.

use super::{LogCheck, Outstanding};
use crate::error::LogViolation;
use greenlight_types::{EventRecord, EventType};

pub(crate) fn check(state: &LogCheck, record: &EventRecord) -> Result<(), LogViolation> {
    match &record.event {
        EventType::WaitStarted { .. } | EventType::SleepStarted { .. } => {
            if let Some(outstanding) = &state.outstanding {
                return Err(LogViolation::OverlappingWait {
                    version: record.version,
                    outstanding: outstanding.describe(),
                });
            }
            Ok(())
        }
        EventType::WaitFulfilled { name, .. } => match &state.outstanding {
            Some(Outstanding::Event(expected)) if expected == name => Ok(()),
            Some(Outstanding::Event(expected)) => Err(LogViolation::FulfilledNameMismatch {
                expected: expected.to_string(),
                actual: name.to_string(),
                version: record.version,
            }),
            _ => Err(LogViolation::FulfilledWithoutWait {
                name: name.to_string(),
                version: record.version,
            }),
        },
        EventType::SleepFired => match &state.outstanding {
            Some(Outstanding::Sleep) => Ok(()),
            _ => Err(LogViolation::SleepFiredWithoutSleep {
                version: record.version,
            }),
        },
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::record;
    use super::*;
    use chrono::Utc;
    use greenlight_types::{EventName, WaitOutcome};

    fn waiting_on(name: &str) -> LogCheck {
        LogCheck {
            len: 2,
            started: true,
            outstanding: Some(Outstanding::Event(EventName::new(name))),
            ..Default::default()
        }
    }

    fn sleeping() -> LogCheck {
        LogCheck {
            len: 2,
            started: true,
            outstanding: Some(Outstanding::Sleep),
            ..Default::default()
        }
    }

    fn wait_started(name: &str) -> EventType {
        EventType::WaitStarted {
            name: EventName::new(name),
            filter: None,
            deadline: None,
        }
    }

    fn fulfilled(name: &str) -> EventType {
        EventType::WaitFulfilled {
            name: EventName::new(name),
            outcome: WaitOutcome::TimedOut,
        }
    }

    #[test]
    fn overlapping_wait_is_rejected() {
        let err = check(
            &waiting_on("creator-decision"),
            &record(3, wait_started("payment-status")),
        )
        .unwrap_err();
        assert_eq!(
            err,
            LogViolation::OverlappingWait {
                version: 3,
                outstanding: "an event wait for 'creator-decision'".to_string(),
            }
        );
    }

    #[test]
    fn sleep_during_wait_is_rejected() {
        let err = check(
            &waiting_on("creator-decision"),
            &record(3, EventType::SleepStarted { until: Utc::now() }),
        )
        .unwrap_err();
        assert!(matches!(err, LogViolation::OverlappingWait { .. }));
    }

    #[test]
    fn fulfilled_must_match_outstanding_name() {
        let err = check(
            &waiting_on("creator-decision"),
            &record(3, fulfilled("payment-status")),
        )
        .unwrap_err();
        assert_eq!(
            err,
            LogViolation::FulfilledNameMismatch {
                expected: "creator-decision".to_string(),
                actual: "payment-status".to_string(),
                version: 3,
            }
        );
    }

    #[test]
    fn fulfilled_without_wait_is_rejected() {
        let state = LogCheck {
            len: 1,
            started: true,
            ..Default::default()
        };
        let err = check(&state, &record(2, fulfilled("creator-decision"))).unwrap_err();
        assert!(matches!(err, LogViolation::FulfilledWithoutWait { .. }));

        let err = check(&sleeping(), &record(3, fulfilled("creator-decision"))).unwrap_err();
        assert!(matches!(err, LogViolation::FulfilledWithoutWait { .. }));
    }

    #[test]
    fn sleep_fired_requires_outstanding_sleep() {
        assert!(check(&sleeping(), &record(3, EventType::SleepFired)).is_ok());

        let err = check(
            &waiting_on("creator-decision"),
            &record(3, EventType::SleepFired),
        )
        .unwrap_err();
        assert_eq!(err, LogViolation::SleepFiredWithoutSleep { version: 3 });
    }

    #[test]
    fn matched_fulfillment_passes() {
        assert!(
            check(
                &waiting_on("creator-decision"),
                &record(3, fulfilled("creator-decision"))
            )
            .is_ok()
        );
    }
}
