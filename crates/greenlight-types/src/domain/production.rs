use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Length of the exclusivity window granted on entering Contract.
pub const EXCLUSIVITY_DAYS: i64 = 30;
/// A company with more active projects than this cannot accept new deals.
pub const MAX_ACTIVE_PROJECTS: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterestType {
    Option,
    Purchase,
    CoProduction,
    Distribution,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionParams {
    pub production_company_id: String,
    pub pitch_id: String,
    pub creator_id: String,
    pub interest_type: InterestType,
}

/// Production deal lifecycle.
///
/// Waitlisted is not terminal: a deal parked behind another deal's
/// exclusivity window returns to Interest when that window is released.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductionState {
    Interest,
    Waitlisted { since: DateTime<Utc> },
    Meeting,
    Proposal,
    Negotiation,
    Contract { exclusivity_expires_at: DateTime<Utc> },
    Production,
    Completed,
    Rejected { reason: String },
    Expired { stage: String },
}

impl ProductionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Interest => "Interest",
            Self::Waitlisted { .. } => "Waitlisted",
            Self::Meeting => "Meeting",
            Self::Proposal => "Proposal",
            Self::Negotiation => "Negotiation",
            Self::Contract { .. } => "Contract",
            Self::Production => "Production",
            Self::Completed => "Completed",
            Self::Rejected { .. } => "Rejected",
            Self::Expired { .. } => "Expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Rejected { .. } | Self::Expired { .. }
        )
    }

    /// Whether this deal currently counts against the pitch's exclusivity.
    pub fn holds_exclusivity(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Contract {
                exclusivity_expires_at,
            } => *exclusivity_expires_at > now,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn waitlisted_is_not_terminal() {
        let state = ProductionState::Waitlisted { since: Utc::now() };
        assert!(!state.is_terminal());
    }

    #[test]
    fn exclusivity_expires() {
        let now = Utc::now();
        let live = ProductionState::Contract {
            exclusivity_expires_at: now + Duration::days(EXCLUSIVITY_DAYS),
        };
        let lapsed = ProductionState::Contract {
            exclusivity_expires_at: now - Duration::seconds(1),
        };
        assert!(live.holds_exclusivity(now));
        assert!(!lapsed.holds_exclusivity(now));
        assert!(!ProductionState::Interest.holds_exclusivity(now));
    }
}
