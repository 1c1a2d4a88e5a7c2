//! NDA risk scoring.
//!
//! A deterministic weighted sum over assessment inputs. The score is
//! computed inside a step and memoized, so routing is identical on every
//! replay. Per-item factors are capped at five counted items each:
//! unbounded sums would let degenerate inputs dominate, and the caps keep
//! the score monotonic in every factor.

use greenlight_types::{RiskAssessment, RiskFactors, RiskLevel, TemplateComplexity};

/// Custom terms beyond this count force a human review.
const CUSTOM_TERMS_REVIEW_THRESHOLD: u32 = 3;
/// Territorial restrictions beyond this count force a human review.
const TERRITORY_REVIEW_THRESHOLD: u32 = 5;
/// Per-item factors stop accumulating past this many items.
const PER_ITEM_CAP: u32 = 5;

pub fn assess(factors: &RiskFactors) -> RiskAssessment {
    let mut score = 0u32;
    let mut requires_review = false;

    if !factors.email_verified {
        score += 10;
    }
    if !factors.phone_verified {
        score += 5;
    }
    if !factors.identity_verified {
        score += 15;
    }

    if factors.account_age_days < 7 {
        score += 10;
    } else if factors.account_age_days < 30 {
        score += 5;
    }

    if factors.trust_score < 50 {
        score += 10;
    }

    score += match factors.template {
        TemplateComplexity::Custom => 20,
        TemplateComplexity::Enhanced => 10,
        TemplateComplexity::Standard => 0,
    };

    score += factors.custom_terms.min(PER_ITEM_CAP) * 5;
    if factors.custom_terms > CUSTOM_TERMS_REVIEW_THRESHOLD {
        requires_review = true;
    }

    if factors.duration_months > 36 {
        score += 10;
    } else if factors.duration_months < 12 {
        score += 5;
    }

    score += factors.territorial_restrictions.min(PER_ITEM_CAP) * 3;
    if factors.territorial_restrictions > TERRITORY_REVIEW_THRESHOLD {
        requires_review = true;
    }

    if factors.prior_breaches > 0 {
        score += 30;
        requires_review = true;
    } else if factors.prior_disputes > 0 {
        score += 15;
    }

    let level = if requires_review || score >= 80 {
        RiskLevel::High
    } else if score >= 40 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };

    RiskAssessment {
        score,
        level,
        requires_review,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greenlight_types::RiskRoute;

    fn clean() -> RiskFactors {
        RiskFactors {
            email_verified: true,
            phone_verified: true,
            identity_verified: true,
            account_age_days: 365,
            trust_score: 90,
            template: TemplateComplexity::Standard,
            custom_terms: 0,
            duration_months: 24,
            territorial_restrictions: 0,
            prior_breaches: 0,
            prior_disputes: 0,
        }
    }

    #[test]
    fn verified_standard_request_auto_approves() {
        let assessment = assess(&clean());
        assert_eq!(assessment.score, 0);
        assert_eq!(assessment.level, RiskLevel::Low);
        assert!(!assessment.requires_review);
        assert_eq!(assessment.route(), RiskRoute::Auto);
    }

    #[test]
    fn prior_breach_forces_high_and_legal_review() {
        let assessment = assess(&RiskFactors {
            prior_breaches: 1,
            ..clean()
        });
        assert_eq!(assessment.score, 30);
        assert_eq!(assessment.level, RiskLevel::High);
        assert!(assessment.requires_review);
        assert_eq!(assessment.route(), RiskRoute::LegalReview);
    }

    #[test]
    fn breach_shadows_dispute() {
        let both = assess(&RiskFactors {
            prior_breaches: 1,
            prior_disputes: 3,
            ..clean()
        });
        let breach_only = assess(&RiskFactors {
            prior_breaches: 1,
            ..clean()
        });
        assert_eq!(both.score, breach_only.score);
    }

    #[test]
    fn account_age_branches_are_mutually_exclusive() {
        assert_eq!(assess(&RiskFactors { account_age_days: 3, ..clean() }).score, 10);
        assert_eq!(assess(&RiskFactors { account_age_days: 20, ..clean() }).score, 5);
        assert_eq!(assess(&RiskFactors { account_age_days: 30, ..clean() }).score, 0);
    }

    #[test]
    fn duration_branches() {
        assert_eq!(assess(&RiskFactors { duration_months: 48, ..clean() }).score, 10);
        assert_eq!(assess(&RiskFactors { duration_months: 6, ..clean() }).score, 5);
        assert_eq!(assess(&RiskFactors { duration_months: 24, ..clean() }).score, 0);
    }

    #[test]
    fn per_item_factors_cap() {
        let at_cap = assess(&RiskFactors {
            custom_terms: 5,
            territorial_restrictions: 5,
            ..clean()
        });
        let beyond_cap = assess(&RiskFactors {
            custom_terms: 50,
            territorial_restrictions: 50,
            ..clean()
        });
        assert_eq!(at_cap.score, 25 + 15);
        assert_eq!(beyond_cap.score, at_cap.score);
        // Five custom terms already exceed the review threshold, and the
        // flag stays tripped far past the score caps.
        assert!(at_cap.requires_review);
        assert!(beyond_cap.requires_review);
    }

    #[test]
    fn custom_terms_above_three_force_review() {
        let assessment = assess(&RiskFactors {
            custom_terms: 4,
            ..clean()
        });
        assert!(assessment.requires_review);
        assert_eq!(assessment.level, RiskLevel::High);
    }

    #[test]
    fn level_thresholds() {
        // Unverified everything, young account, low trust, custom
        // template: 10+5+15+10+10+20 = 70 -> medium.
        let medium = assess(&RiskFactors {
            email_verified: false,
            phone_verified: false,
            identity_verified: false,
            account_age_days: 1,
            trust_score: 10,
            template: TemplateComplexity::Custom,
            ..clean()
        });
        assert_eq!(medium.score, 70);
        assert_eq!(medium.level, RiskLevel::Medium);

        let high = assess(&RiskFactors {
            email_verified: false,
            phone_verified: false,
            identity_verified: false,
            account_age_days: 1,
            trust_score: 10,
            template: TemplateComplexity::Custom,
            prior_disputes: 1,
            ..clean()
        });
        assert_eq!(high.score, 85);
        assert_eq!(high.level, RiskLevel::High);
    }

    /// Increasing any factor never lowers the score.
    #[test]
    fn score_is_monotonic_in_each_factor() {
        let base = clean();
        let worsened: Vec<RiskFactors> = vec![
            RiskFactors { email_verified: false, ..base.clone() },
            RiskFactors { phone_verified: false, ..base.clone() },
            RiskFactors { identity_verified: false, ..base.clone() },
            RiskFactors { account_age_days: 0, ..base.clone() },
            RiskFactors { trust_score: 0, ..base.clone() },
            RiskFactors { template: TemplateComplexity::Enhanced, ..base.clone() },
            RiskFactors { template: TemplateComplexity::Custom, ..base.clone() },
            RiskFactors { custom_terms: base.custom_terms + 1, ..base.clone() },
            RiskFactors { duration_months: 60, ..base.clone() },
            RiskFactors {
                territorial_restrictions: base.territorial_restrictions + 1,
                ..base.clone()
            },
            RiskFactors { prior_breaches: 1, ..base.clone() },
            RiskFactors { prior_disputes: 1, ..base.clone() },
        ];

        let base_score = assess(&base).score;
        for factors in worsened {
            assert!(
                assess(&factors).score >= base_score,
                "worsening {factors:?} lowered the score"
            );
        }
    }
}
