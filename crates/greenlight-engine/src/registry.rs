//! Transition legality.
//!
//! Per kind: the state set, the terminal set, the allowed (from → to)
//! pairs, and the initial state. All checks are pure functions of the
//! tables; the scheduler consults them under the instance write lock
//! before appending any `TransitionApplied`.

use crate::error::EngineError;
use greenlight_types::{DomainState, WorkflowKind};

#[derive(Clone, Copy, Debug)]
pub struct MachineDef {
    pub kind: WorkflowKind,
    pub initial: &'static str,
    pub states: &'static [&'static str],
    pub terminals: &'static [&'static str],
    pub transitions: &'static [(&'static str, &'static str)],
}

const INVESTMENT: MachineDef = MachineDef {
    kind: WorkflowKind::Investment,
    initial: "Interest",
    states: &[
        "Interest",
        "Qualification",
        "Negotiation",
        "TermSheet",
        "DueDiligence",
        "Commitment",
        "Escrow",
        "Closing",
        "Funded",
        "Completed",
        "Withdrawn",
        "Rejected",
        "Expired",
        "Failed",
    ],
    terminals: &["Completed", "Withdrawn", "Rejected", "Expired", "Failed"],
    transitions: &[
        ("Interest", "Qualification"),
        ("Qualification", "Negotiation"),
        ("Qualification", "Rejected"),
        // Counter-offer loop re-enters Negotiation with an updated amount.
        ("Negotiation", "Negotiation"),
        ("Negotiation", "TermSheet"),
        ("Negotiation", "Rejected"),
        ("Negotiation", "Expired"),
        ("TermSheet", "DueDiligence"),
        ("TermSheet", "Rejected"),
        ("TermSheet", "Expired"),
        ("DueDiligence", "Commitment"),
        ("DueDiligence", "Failed"),
        ("Commitment", "Escrow"),
        ("Commitment", "Expired"),
        ("Escrow", "Closing"),
        ("Escrow", "Failed"),
        ("Closing", "Funded"),
        ("Funded", "Completed"),
        // Explicit abort from any non-terminal.
        ("Interest", "Withdrawn"),
        ("Qualification", "Withdrawn"),
        ("Negotiation", "Withdrawn"),
        ("TermSheet", "Withdrawn"),
        ("DueDiligence", "Withdrawn"),
        ("Commitment", "Withdrawn"),
        ("Escrow", "Withdrawn"),
        ("Closing", "Withdrawn"),
        ("Funded", "Withdrawn"),
        ("Interest", "Failed"),
        ("Qualification", "Failed"),
        ("Negotiation", "Failed"),
        ("TermSheet", "Failed"),
        ("Commitment", "Failed"),
        ("Closing", "Failed"),
        ("Funded", "Failed"),
    ],
};

const PRODUCTION: MachineDef = MachineDef {
    kind: WorkflowKind::Production,
    initial: "Interest",
    states: &[
        "Interest",
        "Waitlisted",
        "Meeting",
        "Proposal",
        "Negotiation",
        "Contract",
        "Production",
        "Completed",
        "Rejected",
        "Expired",
    ],
    terminals: &["Completed", "Rejected", "Expired"],
    transitions: &[
        ("Interest", "Waitlisted"),
        ("Interest", "Meeting"),
        ("Interest", "Rejected"),
        ("Waitlisted", "Interest"),
        ("Waitlisted", "Rejected"),
        ("Meeting", "Proposal"),
        ("Meeting", "Rejected"),
        ("Proposal", "Negotiation"),
        ("Proposal", "Rejected"),
        ("Negotiation", "Contract"),
        ("Negotiation", "Rejected"),
        ("Contract", "Production"),
        ("Contract", "Expired"),
        ("Contract", "Rejected"),
        ("Production", "Completed"),
        ("Production", "Rejected"),
    ],
};

const NDA: MachineDef = MachineDef {
    kind: WorkflowKind::Nda,
    initial: "Draft",
    states: &[
        "Draft", "Pending", "Viewed", "Signed", "Active", "Expired", "Rejected",
    ],
    terminals: &["Expired", "Rejected"],
    transitions: &[
        ("Draft", "Pending"),
        ("Draft", "Rejected"),
        ("Pending", "Viewed"),
        // Providers may coalesce the delivered and completed hops.
        ("Pending", "Signed"),
        ("Pending", "Rejected"),
        ("Viewed", "Signed"),
        ("Viewed", "Rejected"),
        ("Signed", "Active"),
        ("Signed", "Rejected"),
        ("Active", "Expired"),
        ("Active", "Rejected"),
    ],
};

#[derive(Clone, Copy, Debug, Default)]
pub struct MachineRegistry;

impl MachineRegistry {
    pub fn new() -> Self {
        Self
    }

    pub fn def(&self, kind: WorkflowKind) -> &'static MachineDef {
        match kind {
            WorkflowKind::Investment => &INVESTMENT,
            WorkflowKind::Production => &PRODUCTION,
            WorkflowKind::Nda => &NDA,
        }
    }

    pub fn is_legal(&self, kind: WorkflowKind, from: &str, to: &str) -> bool {
        self.def(kind)
            .transitions
            .iter()
            .any(|(f, t)| *f == from && *t == to)
    }

    pub fn is_terminal(&self, kind: WorkflowKind, state: &str) -> bool {
        self.def(kind).terminals.contains(&state)
    }

    /// Full legality check for a proposed transition: both states must
    /// belong to `kind` and the (from → to) pair must be in the table.
    pub fn check_transition(
        &self,
        kind: WorkflowKind,
        from: &DomainState,
        to: &DomainState,
    ) -> Result<(), EngineError> {
        if from.kind() != kind || to.kind() != kind {
            return Err(EngineError::Corrupted(format!(
                "transition {from} -> {to} does not belong to a {kind} workflow"
            )));
        }
        if !self.is_legal(kind, from.name(), to.name()) {
            return Err(EngineError::IllegalTransition {
                kind,
                from: from.name(),
                to: to.name(),
            });
        }
        Ok(())
    }
}
