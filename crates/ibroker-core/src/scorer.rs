//! Risk/eligibility scoring port.
//!
//! The scorer is an external collaborator. Its output is advisory: the
//! engine attaches it to decisions when available and proceeds without it
//! when the call fails or times out. Implementations must be pure
//! functions of their inputs so a timed-out call can be retried without
//! double effects.

use crate::error::BrokerError;
use crate::types::{PolicySummary, UserProfile};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Eligibility {
    Eligible,
    PartiallyEligible,
    NotEligible,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Scoring outcome for one user/policy pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// How well the policy fits the user, 0..100.
    pub match_score: u8,
    pub eligibility: Eligibility,
    /// Annual premium as a fraction of annual income.
    pub affordability_ratio: f64,
    pub risk_level: RiskLevel,
    pub risk_reason: String,
    /// Catalog policies to offer instead when the fit is poor.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<PolicySummary>,
}

impl RiskAssessment {
    /// Risk expressed as a 0..1 fraction for the booking record.
    pub fn risk_fraction(&self) -> f64 {
        f64::from(100u8.saturating_sub(self.match_score)) / 100.0
    }

    /// One-line narrative stored as the booking's analysis text.
    pub fn narrative(&self) -> String {
        format!(
            "risk {}: {} (match {}/100, affordability {:.2})",
            self.risk_level.name(),
            self.risk_reason,
            self.match_score,
            self.affordability_ratio
        )
    }
}

/// Pluggable risk/eligibility scorer.
///
/// `policy` is absent for plain enquiry bookings; implementations score
/// the applicant's general insurability in that case.
#[async_trait]
pub trait RiskScorer: Send + Sync {
    async fn score(
        &self,
        profile: &UserProfile,
        policy: Option<&PolicySummary>,
    ) -> Result<RiskAssessment, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_fraction_inverts_match_score() {
        let assessment = RiskAssessment {
            match_score: 80,
            eligibility: Eligibility::Eligible,
            affordability_ratio: 0.04,
            risk_level: RiskLevel::Low,
            risk_reason: "stable income".to_string(),
            alternatives: Vec::new(),
        };
        assert!((assessment.risk_fraction() - 0.2).abs() < f64::EPSILON);
        assert!(assessment.narrative().contains("risk low"));
    }
}
