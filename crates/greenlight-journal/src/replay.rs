//! Folding event logs into [`InstanceState`].
//!
//! This is the canonical recovery path: load the latest snapshot, read
//! the tail, and fold. Rebuilding from version 0 must produce a state
//! identical to any snapshot along the way; snapshots are a cache, not
//! a source of truth.

use crate::error::ReplayError;
use greenlight_types::{
    EventRecord, EventType, FailedStep, FulfilledWait, InstanceState, InstanceStatus, Snapshot,
    StartInfo, WaitDescriptor,
};

/// Construct the initial state from the log's first record.
///
/// The first event of every log is `InstanceStarted`; anything else means
/// the log is corrupt.
pub fn from_start(record: &EventRecord) -> Result<InstanceState, ReplayError> {
    match &record.event {
        EventType::InstanceStarted {
            kind,
            params,
            client_token,
        } => {
            let mut state = InstanceState::new(StartInfo {
                kind: *kind,
                params: params.clone(),
                client_token: client_token.clone(),
            });
            state.version = record.version;
            Ok(state)
        }
        other => Err(ReplayError::MissingStart {
            first_event: other.name().to_string(),
        }),
    }
}

/// Apply a single event to the state (one fold step).
///
/// Events that do not affect the fold (`StepStarted` bookkeeping aside)
/// still advance the version: the state always reflects exactly the
/// prefix it was folded from.
pub fn apply(state: &mut InstanceState, record: &EventRecord) {
    match &record.event {
        EventType::InstanceStarted { .. } => {
            // Handled by `from_start`; a mid-log start is caught by the
            // invariant checker.
        }
        EventType::StepStarted { step, .. } => {
            state.started_steps.insert(step.clone());
        }
        EventType::StepRetrying { .. } => {}
        EventType::StepSucceeded {
            step,
            output,
            compensation,
        } => {
            state.memo.insert(step.clone(), output.clone());
            if let Some(op) = compensation {
                state
                    .comp_stack
                    .push(greenlight_types::CompensationEntry {
                        step: step.clone(),
                        op: op.clone(),
                    });
            }
            if state
                .last_error
                .as_ref()
                .is_some_and(|failed| &failed.step == step)
            {
                state.last_error = None;
            }
        }
        EventType::StepFailed { step, error } => {
            state.last_error = Some(FailedStep {
                step: step.clone(),
                error: error.clone(),
            });
        }
        EventType::WaitStarted {
            name,
            filter,
            deadline,
        } => {
            state.wait = Some(WaitDescriptor::Event {
                name: name.clone(),
                filter: filter.clone(),
                deadline: *deadline,
            });
            state.status = InstanceStatus::Waiting;
        }
        EventType::WaitFulfilled { name, outcome } => {
            state.wait = None;
            state.last_wait = Some(FulfilledWait {
                name: name.clone(),
                outcome: outcome.clone(),
            });
            state.status = InstanceStatus::Runnable;
        }
        EventType::SleepStarted { until } => {
            state.wait = Some(WaitDescriptor::Sleep { until: *until });
            state.status = InstanceStatus::Sleeping;
        }
        EventType::SleepFired => {
            state.wait = None;
            state.sleep_fired = true;
            state.status = InstanceStatus::Runnable;
        }
        EventType::TransitionApplied { to, .. } => {
            state.state = to.clone();
            state.last_wait = None;
            state.sleep_fired = false;
            state.last_error = None;
        }
        EventType::ExternalEvent { .. } => {
            // Durable receipt only; consumption shows up as WaitFulfilled.
        }
        EventType::AbortRequested { reason } => {
            state.abort_reason = Some(reason.clone());
        }
        EventType::CompensationApplied { step, outcome } => {
            state.status = InstanceStatus::Compensating;
            if let Some(pos) = state.comp_stack.iter().rposition(|e| &e.step == step) {
                state.comp_stack.remove(pos);
            }
            state.comp_outcomes.push(outcome.clone());
        }
        EventType::InstanceCompleted { .. } => {
            state.status = InstanceStatus::Completed;
        }
        EventType::InstanceFailed { error, .. } => {
            state.status = InstanceStatus::Failed;
            if state.last_error.is_none() {
                state.last_error = Some(FailedStep {
                    step: greenlight_types::StepName::new("instance"),
                    error: error.clone(),
                });
            }
        }
    }
    state.version = record.version;
}

/// Fold a complete log (version 1..) into state.
pub fn fold(records: &[EventRecord]) -> Result<InstanceState, ReplayError> {
    let first = records.first().ok_or(ReplayError::EmptyLog)?;
    let mut state = from_start(first)?;
    for record in &records[1..] {
        apply(&mut state, record);
    }
    Ok(state)
}

/// Rebuild current state from the latest snapshot plus the tail of the
/// log after it. With no snapshot, folds from the start.
pub fn rebuild(
    snapshot: Option<Snapshot>,
    tail: &[EventRecord],
) -> Result<InstanceState, ReplayError> {
    match snapshot {
        Some(snap) => {
            let mut state = snap.state;
            for record in tail {
                apply(&mut state, record);
            }
            Ok(state)
        }
        None => fold(tail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use greenlight_types::{
        CompensationOp, DomainState, EventId, EventName, InstanceId, InvestmentParams,
        InvestmentState, InvestmentType, Payload, StartParams, StepError, StepName, WaitOutcome,
        WorkflowKind,
    };

    fn instance() -> InstanceId {
        InstanceId::derive(WorkflowKind::Investment, "replay-test")
    }

    fn params() -> StartParams {
        StartParams::Investment(InvestmentParams {
            investor_id: "inv-1".into(),
            creator_id: "cre-1".into(),
            pitch_id: "pitch-1".into(),
            proposed_amount: 250_000,
            investment_type: InvestmentType::Equity,
            nda_accepted: true,
        })
    }

    fn record(version: u64, event: EventType) -> EventRecord {
        EventRecord {
            event_id: EventId::derive(&instance(), version),
            version,
            timestamp: Utc::now(),
            event,
        }
    }

    fn started() -> EventRecord {
        record(
            1,
            EventType::InstanceStarted {
                kind: WorkflowKind::Investment,
                params: params(),
                client_token: "replay-test".into(),
            },
        )
    }

    #[test]
    fn fold_rejects_logs_not_starting_with_instance_started() {
        let records = vec![record(1, EventType::SleepFired)];
        assert_eq!(
            fold(&records),
            Err(ReplayError::MissingStart {
                first_event: "SleepFired".into()
            })
        );
        assert_eq!(fold(&[]), Err(ReplayError::EmptyLog));
    }

    #[test]
    fn step_success_memoizes_and_registers_compensation() {
        let step = StepName::new("hold-funds");
        let records = vec![
            started(),
            record(
                2,
                EventType::StepStarted {
                    step: step.clone(),
                    attempt: 1,
                },
            ),
            record(
                3,
                EventType::StepSucceeded {
                    step: step.clone(),
                    output: Payload::from_value(serde_json::json!({"intent_id": "pi_1"})),
                    compensation: Some(CompensationOp::RefundPayment {
                        intent_step: step.clone(),
                    }),
                },
            ),
        ];

        let state = fold(&records).unwrap();
        assert_eq!(state.version, 3);
        assert!(state.has_step(&step));
        assert_eq!(state.comp_stack.len(), 1);
        assert_eq!(state.comp_stack[0].step, step);
        assert_eq!(state.status, InstanceStatus::Runnable);
    }

    #[test]
    fn wait_lifecycle_tracks_status_and_last_wait() {
        let name = EventName::new("creator-decision");
        let records = vec![
            started(),
            record(
                2,
                EventType::WaitStarted {
                    name: name.clone(),
                    filter: None,
                    deadline: None,
                },
            ),
        ];
        let waiting = fold(&records).unwrap();
        assert_eq!(waiting.status, InstanceStatus::Waiting);
        assert!(waiting.wait.is_some());

        let mut records = records;
        records.push(record(
            3,
            EventType::WaitFulfilled {
                name: name.clone(),
                outcome: WaitOutcome::TimedOut,
            },
        ));
        let fulfilled = fold(&records).unwrap();
        assert_eq!(fulfilled.status, InstanceStatus::Runnable);
        assert!(fulfilled.wait.is_none());
        assert!(fulfilled.last_wait_for(&name).unwrap().is_timeout());
    }

    #[test]
    fn transition_consumes_wait_outcome_and_error() {
        let name = EventName::new("creator-decision");
        let step = StepName::new("verify-accreditation");
        let records = vec![
            started(),
            record(
                2,
                EventType::StepStarted {
                    step: step.clone(),
                    attempt: 1,
                },
            ),
            record(
                3,
                EventType::StepFailed {
                    step: step.clone(),
                    error: StepError::domain("not accredited"),
                },
            ),
            record(
                4,
                EventType::WaitStarted {
                    name: name.clone(),
                    filter: None,
                    deadline: None,
                },
            ),
            record(
                5,
                EventType::WaitFulfilled {
                    name: name.clone(),
                    outcome: WaitOutcome::TimedOut,
                },
            ),
            record(
                6,
                EventType::TransitionApplied {
                    from: DomainState::Investment(InvestmentState::Interest),
                    to: DomainState::Investment(InvestmentState::Qualification),
                },
            ),
        ];

        let state = fold(&records).unwrap();
        assert_eq!(state.state.name(), "Qualification");
        assert!(state.last_wait.is_none());
        assert!(state.last_error.is_none());
    }

    #[test]
    fn rebuild_from_snapshot_equals_full_fold() {
        let name = EventName::new("creator-decision");
        let records = vec![
            started(),
            record(
                2,
                EventType::WaitStarted {
                    name: name.clone(),
                    filter: None,
                    deadline: None,
                },
            ),
            record(
                3,
                EventType::WaitFulfilled {
                    name,
                    outcome: WaitOutcome::Event {
                        payload: Payload::from_value(serde_json::json!({"decision": "approve"})),
                    },
                },
            ),
        ];

        let prefix = fold(&records[..2]).unwrap();
        let snapshot = Snapshot {
            taken_at: Utc::now(),
            state: prefix,
        };

        let from_snapshot = rebuild(Some(snapshot), &records[2..]).unwrap();
        let from_scratch = fold(&records).unwrap();
        similar_asserts::assert_eq!(from_snapshot, from_scratch);
    }
}
