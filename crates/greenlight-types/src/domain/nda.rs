use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequesterType {
    Investor,
    Production,
    Partner,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NdaParams {
    pub requester_id: String,
    pub requester_type: RequesterType,
    pub requester_email: String,
    pub pitch_id: String,
    pub creator_id: String,
    pub template_id: String,
    /// Months of pitch access granted on signature. Default 24.
    pub duration_months: u32,
    /// Custom terms beyond the template. Each raises the risk score.
    #[serde(default)]
    pub custom_terms: Vec<String>,
    /// Territorial restrictions. Each raises the risk score.
    #[serde(default)]
    pub territorial_restrictions: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateComplexity {
    Standard,
    Enhanced,
    /// Custom or unrecognized templates score highest.
    Custom,
}

/// Inputs to the deterministic risk score.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFactors {
    pub email_verified: bool,
    pub phone_verified: bool,
    pub identity_verified: bool,
    pub account_age_days: u32,
    pub trust_score: u32,
    pub template: TemplateComplexity,
    pub custom_terms: u32,
    pub duration_months: u32,
    pub territorial_restrictions: u32,
    pub prior_breaches: u32,
    pub prior_disputes: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Which human-approval path the NDA takes out of Draft.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskRoute {
    /// No human gate; sent for signature immediately.
    Auto,
    /// Pitch creator reviews, 72h window.
    CreatorReview,
    /// Legal reviews, 48h window.
    LegalReview,
}

/// Output of the risk scorer, memoized as a step output so routing is
/// identical on every replay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: u32,
    pub level: RiskLevel,
    pub requires_review: bool,
}

impl RiskAssessment {
    /// Routing thresholds are distinct from the level thresholds:
    /// below 30 auto-approves, below 70 goes to the creator, everything
    /// else (or a forced review) goes to legal.
    pub fn route(&self) -> RiskRoute {
        if self.requires_review || self.score >= 70 {
            RiskRoute::LegalReview
        } else if self.score >= 30 {
            RiskRoute::CreatorReview
        } else {
            RiskRoute::Auto
        }
    }
}

/// NDA lifecycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NdaState {
    Draft,
    Pending { route: RiskRoute },
    Viewed,
    Signed,
    Active { expires_at: DateTime<Utc> },
    Expired,
    Rejected { reason: String },
}

impl NdaState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Draft => "Draft",
            Self::Pending { .. } => "Pending",
            Self::Viewed => "Viewed",
            Self::Signed => "Signed",
            Self::Active { .. } => "Active",
            Self::Expired => "Expired",
            Self::Rejected { .. } => "Rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired | Self::Rejected { .. })
    }
}
