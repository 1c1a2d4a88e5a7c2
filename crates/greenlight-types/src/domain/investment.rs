use serde::{Deserialize, Serialize};

/// Smallest investment accepted at start, in whole currency units.
pub const MIN_INVESTMENT: u64 = 1_000;
/// Largest investment accepted at start.
pub const MAX_INVESTMENT: u64 = 10_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestmentType {
    Equity,
    Debt,
    Convertible,
    RevenueShare,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvestmentParams {
    pub investor_id: String,
    pub creator_id: String,
    pub pitch_id: String,
    pub proposed_amount: u64,
    pub investment_type: InvestmentType,
    pub nda_accepted: bool,
}

/// Whose answer the negotiation is currently waiting on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationTurn {
    Creator,
    Investor,
}

/// Investment deal lifecycle.
///
/// The agreed amount rides inside the states from Negotiation onward; a
/// counter-offer re-enters Negotiation with the updated amount and an
/// incremented round count.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvestmentState {
    Interest,
    Qualification,
    Negotiation {
        amount: u64,
        counter_rounds: u32,
        turn: NegotiationTurn,
    },
    TermSheet {
        agreed_amount: u64,
    },
    DueDiligence {
        agreed_amount: u64,
    },
    Commitment {
        agreed_amount: u64,
    },
    Escrow {
        agreed_amount: u64,
    },
    Closing {
        agreed_amount: u64,
    },
    Funded {
        agreed_amount: u64,
    },
    Completed {
        agreed_amount: u64,
    },
    Withdrawn {
        reason: String,
    },
    Rejected {
        reason: String,
    },
    Expired {
        stage: String,
    },
    Failed {
        reason: String,
    },
}

impl InvestmentState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Interest => "Interest",
            Self::Qualification => "Qualification",
            Self::Negotiation { .. } => "Negotiation",
            Self::TermSheet { .. } => "TermSheet",
            Self::DueDiligence { .. } => "DueDiligence",
            Self::Commitment { .. } => "Commitment",
            Self::Escrow { .. } => "Escrow",
            Self::Closing { .. } => "Closing",
            Self::Funded { .. } => "Funded",
            Self::Completed { .. } => "Completed",
            Self::Withdrawn { .. } => "Withdrawn",
            Self::Rejected { .. } => "Rejected",
            Self::Expired { .. } => "Expired",
            Self::Failed { .. } => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. }
                | Self::Withdrawn { .. }
                | Self::Rejected { .. }
                | Self::Expired { .. }
                | Self::Failed { .. }
        )
    }

    /// The amount carried by the state, once one has been negotiated.
    pub fn amount(&self) -> Option<u64> {
        match self {
            Self::Negotiation { amount, .. } => Some(*amount),
            Self::TermSheet { agreed_amount }
            | Self::DueDiligence { agreed_amount }
            | Self::Commitment { agreed_amount }
            | Self::Escrow { agreed_amount }
            | Self::Closing { agreed_amount }
            | Self::Funded { agreed_amount }
            | Self::Completed { agreed_amount } => Some(*agreed_amount),
            _ => None,
        }
    }
}
