//! Domain model for the three deal workflows.
//!
//! States are data-carrying enums: the negotiated amount, exclusivity
//! window, or access expiry travels inside the state itself, so a
//! `TransitionApplied { from, to }` event carries everything the fold
//! needs and rebuilding never consults anything but the log.

mod investment;
mod nda;
mod production;

pub use investment::{
    InvestmentParams, InvestmentState, InvestmentType, MAX_INVESTMENT, MIN_INVESTMENT,
    NegotiationTurn,
};
pub use nda::{
    NdaParams, NdaState, RequesterType, RiskAssessment, RiskFactors, RiskLevel, RiskRoute,
    TemplateComplexity,
};
pub use production::{
    EXCLUSIVITY_DAYS, InterestType, MAX_ACTIVE_PROJECTS, ProductionParams, ProductionState,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// The three first-class workflow kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowKind {
    Investment,
    Production,
    Nda,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Investment => "investment",
            Self::Production => "production",
            Self::Nda => "nda",
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific immutable creation parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartParams {
    Investment(InvestmentParams),
    Production(ProductionParams),
    Nda(NdaParams),
}

impl StartParams {
    pub fn kind(&self) -> WorkflowKind {
        match self {
            Self::Investment(_) => WorkflowKind::Investment,
            Self::Production(_) => WorkflowKind::Production,
            Self::Nda(_) => WorkflowKind::Nda,
        }
    }

    /// The pitch every kind is anchored to.
    pub fn pitch_id(&self) -> &str {
        match self {
            Self::Investment(p) => &p.pitch_id,
            Self::Production(p) => &p.pitch_id,
            Self::Nda(p) => &p.pitch_id,
        }
    }

    /// The initiating party (investor, production company, requester).
    pub fn initiator_id(&self) -> &str {
        match self {
            Self::Investment(p) => &p.investor_id,
            Self::Production(p) => &p.production_company_id,
            Self::Nda(p) => &p.requester_id,
        }
    }

    pub fn creator_id(&self) -> &str {
        match self {
            Self::Investment(p) => &p.creator_id,
            Self::Production(p) => &p.creator_id,
            Self::Nda(p) => &p.creator_id,
        }
    }
}

/// Current logical state of an instance, tagged by kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainState {
    Investment(InvestmentState),
    Production(ProductionState),
    Nda(NdaState),
}

impl DomainState {
    /// Initial state for a freshly started instance of `kind`.
    pub fn initial(kind: WorkflowKind) -> Self {
        match kind {
            WorkflowKind::Investment => Self::Investment(InvestmentState::Interest),
            WorkflowKind::Production => Self::Production(ProductionState::Interest),
            WorkflowKind::Nda => Self::Nda(NdaState::Draft),
        }
    }

    pub fn kind(&self) -> WorkflowKind {
        match self {
            Self::Investment(_) => WorkflowKind::Investment,
            Self::Production(_) => WorkflowKind::Production,
            Self::Nda(_) => WorkflowKind::Nda,
        }
    }

    /// The state's name, independent of any data the variant carries.
    /// Registry transition tables are keyed by these names.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Investment(s) => s.name(),
            Self::Production(s) => s.name(),
            Self::Nda(s) => s.name(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Investment(s) => s.is_terminal(),
            Self::Production(s) => s.is_terminal(),
            Self::Nda(s) => s.is_terminal(),
        }
    }

    /// Terminal states that represent a failed transaction (and therefore
    /// trigger compensation) as opposed to a concluded one.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Investment(InvestmentState::Failed { .. }))
    }

    /// The human-readable reason a terminal state carries, if any.
    pub fn terminal_reason(&self) -> Option<String> {
        match self {
            Self::Investment(state) => match state {
                InvestmentState::Withdrawn { reason }
                | InvestmentState::Rejected { reason }
                | InvestmentState::Failed { reason } => Some(reason.clone()),
                InvestmentState::Expired { stage } => {
                    Some(format!("expired at {stage}"))
                }
                _ => None,
            },
            Self::Production(state) => match state {
                ProductionState::Rejected { reason } => Some(reason.clone()),
                ProductionState::Expired { stage } => Some(format!("expired at {stage}")),
                _ => None,
            },
            Self::Nda(state) => match state {
                NdaState::Rejected { reason } => Some(reason.clone()),
                _ => None,
            },
        }
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.name())
    }
}
