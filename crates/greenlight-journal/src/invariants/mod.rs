//! Event-log invariant checking engine.
//!
//! Two modes of validation:
//! - **Incremental** ([`LogCheck::check_append`]): O(1) per record via
//!   accumulated auxiliary state. Used at append time to reject invalid
//!   records before they hit the log.
//! - **Batch** ([`validate_log`]): O(n) full scan that collects all
//!   violations. Used for diagnostics and recovery.
//!
//! Checks are grouped into four sub-modules:
//! - [`structural`]: version numbering, lifecycle bookends, terminal
//!   finality.
//! - [`steps`]: Started → Succeeded/Failed ordering, at-most-once
//!   success per step name.
//! - [`waits`]: single outstanding suspension, fulfilled/fired matching.
//! - [`compensation`]: LIFO pop order over registered compensators,
//!   failure-evidence gating.
//!
//! Each sub-module exposes a single
//! `check(&LogCheck, &EventRecord) -> Result<(), LogViolation>` function.
//! Sub-modules are read-only over state; all mutations happen in
//! [`LogCheck::apply_record`].

mod compensation;
mod steps;
mod structural;
mod waits;

use crate::error::LogViolation;
use greenlight_types::{
    EventLog, EventRecord, EventType, InstanceState, StepName, WaitDescriptor,
};
use std::collections::HashSet;

/// What kind of suspension is currently outstanding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Outstanding {
    Event(greenlight_types::EventName),
    Sleep,
}

impl Outstanding {
    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Event(name) => format!("an event wait for '{name}'"),
            Self::Sleep => "a sleep".to_string(),
        }
    }
}

/// Accumulated auxiliary state for O(1) incremental invariant checking.
///
/// Each field tracks just enough information from previously ingested
/// records to validate the next append without rescanning the log.
#[derive(Clone, Debug, Default)]
pub struct LogCheck {
    /// Number of records ingested so far; the next version must be
    /// `len + 1`.
    pub(crate) len: u64,

    /// Whether the opening `InstanceStarted` has been seen.
    pub(crate) started: bool,

    /// Version of the first terminal event, if any.
    pub(crate) terminal_at: Option<u64>,

    /// Steps with a recorded `StepStarted`.
    pub(crate) started_steps: HashSet<StepName>,

    /// Steps with a recorded `StepSucceeded`.
    pub(crate) succeeded_steps: HashSet<StepName>,

    /// The outstanding wait or sleep, at most one.
    pub(crate) outstanding: Option<Outstanding>,

    /// Whether an abort, step failure, or failure transition has been
    /// seen. Gates compensation.
    pub(crate) failure_seen: bool,

    /// Registered compensators in push order; pops must come off the end.
    pub(crate) comp_stack: Vec<StepName>,

    /// Compensators already applied.
    pub(crate) comp_applied: HashSet<StepName>,
}

impl LogCheck {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the checker from a rebuilt state, so append-time validation
    /// works from a snapshot without rescanning the whole log.
    pub fn from_state(state: &InstanceState) -> Self {
        let outstanding = state.wait.as_ref().map(|wait| match wait {
            WaitDescriptor::Event { name, .. } => Outstanding::Event(name.clone()),
            WaitDescriptor::Sleep { .. } => Outstanding::Sleep,
        });
        Self {
            len: state.version,
            started: true,
            terminal_at: state.status.is_terminal().then_some(state.version),
            started_steps: state.started_steps.iter().cloned().collect(),
            succeeded_steps: state.memo.keys().cloned().collect(),
            outstanding,
            failure_seen: state.abort_reason.is_some()
                || state.last_error.is_some()
                || state.state.is_failure(),
            comp_stack: state.comp_stack.iter().map(|e| e.step.clone()).collect(),
            comp_applied: state
                .comp_outcomes
                .iter()
                .map(|o| o.step.clone())
                .collect(),
        }
    }

    /// Validate and ingest a single record (incremental path).
    ///
    /// Runs all four groups against the accumulated state, then updates
    /// the state on success.
    pub fn check_append(&mut self, record: &EventRecord) -> Result<(), LogViolation> {
        structural::check(self, record)?;
        steps::check(self, record)?;
        waits::check(self, record)?;
        compensation::check(self, record)?;
        self.apply_record(record);
        Ok(())
    }

    /// Run all groups, collecting up to one violation per group.
    ///
    /// Unlike [`check_append`], this does not short-circuit across groups,
    /// so a single pass over a corrupt log surfaces multiple independent
    /// issues.
    fn collect_record_violations(
        &self,
        record: &EventRecord,
        violations: &mut Vec<LogViolation>,
    ) {
        if let Err(v) = structural::check(self, record) {
            violations.push(v);
        }
        if let Err(v) = steps::check(self, record) {
            violations.push(v);
        }
        if let Err(v) = waits::check(self, record) {
            violations.push(v);
        }
        if let Err(v) = compensation::check(self, record) {
            violations.push(v);
        }
    }

    /// Update auxiliary state after a record passes validation (or is
    /// force-applied during batch validation). Centralized so all state
    /// mutations are visible in one place.
    fn apply_record(&mut self, record: &EventRecord) {
        match &record.event {
            EventType::InstanceStarted { .. } => {
                self.started = true;
            }
            EventType::InstanceCompleted { .. } | EventType::InstanceFailed { .. } => {
                self.terminal_at.get_or_insert(record.version);
            }
            EventType::AbortRequested { .. } => {
                self.failure_seen = true;
            }
            EventType::StepStarted { step, .. } => {
                self.started_steps.insert(step.clone());
            }
            EventType::StepSucceeded {
                step, compensation, ..
            } => {
                self.succeeded_steps.insert(step.clone());
                if compensation.is_some() {
                    self.comp_stack.push(step.clone());
                }
            }
            EventType::StepFailed { .. } => {
                self.failure_seen = true;
            }
            EventType::WaitStarted { name, .. } => {
                self.outstanding = Some(Outstanding::Event(name.clone()));
            }
            EventType::SleepStarted { .. } => {
                self.outstanding = Some(Outstanding::Sleep);
            }
            EventType::WaitFulfilled { .. } | EventType::SleepFired => {
                self.outstanding = None;
            }
            EventType::TransitionApplied { to, .. } => {
                if to.is_failure() {
                    self.failure_seen = true;
                }
            }
            EventType::CompensationApplied { step, .. } => {
                if let Some(pos) = self.comp_stack.iter().rposition(|s| s == step) {
                    self.comp_stack.remove(pos);
                }
                self.comp_applied.insert(step.clone());
            }
            EventType::StepRetrying { .. } | EventType::ExternalEvent { .. } => {}
        }
        self.len += 1;
    }
}

/// Batch-validate an entire log, returning all detected violations.
///
/// Feeds every record through the group checkers, always applying state
/// regardless of errors so later records are checked against accurate
/// accumulated state. An empty log reports a missing `InstanceStarted`.
pub fn validate_log(log: &EventLog) -> Vec<LogViolation> {
    if log.records.is_empty() {
        return vec![LogViolation::MissingInstanceStarted {
            first_event: "<empty>".to_string(),
        }];
    }

    let mut check = LogCheck::new();
    let mut violations = Vec::new();

    for record in &log.records {
        check.collect_record_violations(record, &mut violations);
        check.apply_record(record);
    }

    violations
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;
    use greenlight_types::{
        EventId, EventRecord, EventType, InstanceId, InvestmentParams, InvestmentType, StartParams,
        WorkflowKind,
    };

    pub(crate) fn instance() -> InstanceId {
        InstanceId::derive(WorkflowKind::Investment, "invariant-test")
    }

    pub(crate) fn record(version: u64, event: EventType) -> EventRecord {
        EventRecord {
            event_id: EventId::derive(&instance(), version),
            version,
            timestamp: Utc::now(),
            event,
        }
    }

    pub(crate) fn started_event() -> EventType {
        EventType::InstanceStarted {
            kind: WorkflowKind::Investment,
            params: StartParams::Investment(InvestmentParams {
                investor_id: "inv-1".into(),
                creator_id: "cre-1".into(),
                pitch_id: "pitch-1".into(),
                proposed_amount: 50_000,
                investment_type: InvestmentType::Equity,
                nda_accepted: true,
            }),
            client_token: "invariant-test".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{record, started_event};
    use super::*;
    use greenlight_types::{DomainState, InstanceId, InvestmentState, Payload, StepError};

    #[test]
    fn check_append_accepts_a_well_formed_prefix() {
        let step = StepName::new("record-interest");
        let mut check = LogCheck::new();

        check.check_append(&record(1, started_event())).unwrap();
        check
            .check_append(&record(
                2,
                EventType::StepStarted {
                    step: step.clone(),
                    attempt: 1,
                },
            ))
            .unwrap();
        check
            .check_append(&record(
                3,
                EventType::StepSucceeded {
                    step,
                    output: Payload::null(),
                    compensation: None,
                },
            ))
            .unwrap();

        assert_eq!(check.len, 3);
    }

    #[test]
    fn validate_log_collects_multiple_violations() {
        let step = StepName::new("hold-funds");
        let log = EventLog {
            instance_id: InstanceId::derive(
                greenlight_types::WorkflowKind::Investment,
                "invariant-test",
            ),
            records: vec![
                record(1, started_event()),
                // Succeeds without ever starting.
                record(
                    2,
                    EventType::StepSucceeded {
                        step: step.clone(),
                        output: Payload::null(),
                        compensation: None,
                    },
                ),
                // Terminal in the middle of the log.
                record(
                    3,
                    EventType::InstanceCompleted {
                        final_state: DomainState::Investment(InvestmentState::Completed {
                            agreed_amount: 50_000,
                        }),
                    },
                ),
                record(
                    4,
                    EventType::StepFailed {
                        step: StepName::new("other"),
                        error: StepError::fatal("late"),
                    },
                ),
            ],
        };

        let violations = validate_log(&log);
        assert!(violations.iter().any(|v| matches!(
            v,
            LogViolation::SucceededWithoutStarted { .. }
        )));
        assert!(violations
            .iter()
            .any(|v| matches!(v, LogViolation::TerminalNotLast { .. })));
    }

    #[test]
    fn empty_log_reports_missing_start() {
        let log = EventLog {
            instance_id: InstanceId::derive(
                greenlight_types::WorkflowKind::Investment,
                "invariant-test",
            ),
            records: vec![],
        };
        assert_eq!(
            validate_log(&log),
            vec![LogViolation::MissingInstanceStarted {
                first_event: "<empty>".into()
            }]
        );
    }
}
