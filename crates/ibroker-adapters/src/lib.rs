//! Collaborator adapters for iBroker.
//!
//! The engine only knows the `RiskScorer` and `EventSink` ports; these
//! are the concrete implementations wired in by the service (plus
//! deterministic failure doubles for degradation testing).

#![deny(unsafe_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ibroker_core::error::BrokerError;
use ibroker_core::events::{DomainEvent, EventSink};
use ibroker_core::scorer::{Eligibility, RiskAssessment, RiskLevel, RiskScorer};
use ibroker_core::types::{BookingAction, PolicySummary, UserId, UserProfile};
use std::sync::Mutex;
use uuid::Uuid;

// ── Advisory scorer ──────────────────────────────────────────────────

/// Thresholds for the deterministic advisory scorer.
#[derive(Debug, Clone)]
pub struct AdvisoryScorerConfig {
    /// Premium above this share of income needs a closer look.
    pub affordability_review_ratio: f64,
    /// Premium above this share of income is out of reach.
    pub affordability_block_ratio: f64,
    /// Weighted risk at/above this value classifies as medium.
    pub medium_risk_threshold: u8,
    /// Weighted risk at/above this value classifies as high.
    pub high_risk_threshold: u8,
    /// Flat risk uplift for smokers.
    pub smoker_penalty: u8,
}

impl Default for AdvisoryScorerConfig {
    fn default() -> Self {
        Self {
            affordability_review_ratio: 0.10,
            affordability_block_ratio: 0.25,
            medium_risk_threshold: 35,
            high_risk_threshold: 60,
            smoker_penalty: 15,
        }
    }
}

/// Rule-based risk/eligibility scorer.
///
/// Intentionally free of probabilistic side effects: the same profile and
/// policy always produce the same assessment, so the engine may retry a
/// timed-out call without double effects. Integer factor arithmetic keeps
/// results stable across platforms.
#[derive(Debug, Clone, Default)]
pub struct AdvisoryScorer {
    config: AdvisoryScorerConfig,
    /// Catalog slice to draw alternative suggestions from.
    alternatives: Vec<PolicySummary>,
}

impl AdvisoryScorer {
    pub fn new(config: AdvisoryScorerConfig) -> Self {
        Self {
            config,
            alternatives: Vec::new(),
        }
    }

    pub fn with_alternatives(mut self, catalog: Vec<PolicySummary>) -> Self {
        self.alternatives = catalog;
        self
    }

    fn affordability_ratio(profile: &UserProfile, policy: Option<&PolicySummary>) -> f64 {
        let Some(policy) = policy else { return 0.0 };
        if profile.annual_income_minor == 0 {
            return 1.0;
        }
        policy.annual_premium_minor as f64 / profile.annual_income_minor as f64
    }

    fn age_factor(profile: &UserProfile, policy: Option<&PolicySummary>) -> u8 {
        match policy {
            Some(policy) if profile.age < policy.min_age || profile.age > policy.max_age => 100,
            _ => match profile.age {
                0 => 80,
                1..=29 => 10,
                30..=44 => 20,
                45..=59 => 40,
                _ => 70,
            },
        }
    }

    fn affordability_factor(&self, ratio: f64) -> u8 {
        let scaled = (ratio / self.config.affordability_block_ratio * 100.0).round();
        scaled.clamp(0.0, 100.0) as u8
    }

    fn suggest_alternatives(
        &self,
        profile: &UserProfile,
        scored: Option<&PolicySummary>,
    ) -> Vec<PolicySummary> {
        let budget =
            (profile.annual_income_minor as f64 * self.config.affordability_review_ratio) as u64;
        self.alternatives
            .iter()
            .filter(|candidate| {
                scored.map(|s| candidate.policy_id != s.policy_id).unwrap_or(true)
                    && candidate.annual_premium_minor <= budget.max(1)
                    && profile.age >= candidate.min_age
                    && profile.age <= candidate.max_age
            })
            .take(3)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RiskScorer for AdvisoryScorer {
    async fn score(
        &self,
        profile: &UserProfile,
        policy: Option<&PolicySummary>,
    ) -> Result<RiskAssessment, BrokerError> {
        let ratio = Self::affordability_ratio(profile, policy);
        let age_factor = Self::age_factor(profile, policy);
        let affordability_factor = self.affordability_factor(ratio);
        let dependents_factor = (profile.dependents.min(5) * 10) as u8;
        let smoker_factor = if profile.smoker {
            self.config.smoker_penalty
        } else {
            0
        };

        // Weighted deterministic risk over all factors.
        let risk = ((age_factor as u16 * 35
            + affordability_factor as u16 * 40
            + dependents_factor as u16 * 10
            + smoker_factor as u16 * 15)
            / 100) as u8;
        let match_score = 100u8.saturating_sub(risk);

        let age_banded = policy
            .map(|p| profile.age >= p.min_age && profile.age <= p.max_age)
            .unwrap_or(profile.age >= 18);

        let (eligibility, risk_reason) = if !age_banded {
            (
                Eligibility::NotEligible,
                "applicant age falls outside the policy band".to_string(),
            )
        } else if profile.annual_income_minor == 0 && policy.is_some() {
            (
                Eligibility::NotEligible,
                "no verified income on record".to_string(),
            )
        } else if ratio > self.config.affordability_block_ratio {
            (
                Eligibility::NotEligible,
                format!("premium takes {:.0}% of income", ratio * 100.0),
            )
        } else if ratio > self.config.affordability_review_ratio {
            (
                Eligibility::PartiallyEligible,
                format!("premium takes {:.0}% of income", ratio * 100.0),
            )
        } else {
            (
                Eligibility::Eligible,
                "profile fits the policy band".to_string(),
            )
        };

        let risk_level = if risk >= self.config.high_risk_threshold {
            RiskLevel::High
        } else if risk >= self.config.medium_risk_threshold {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        let alternatives = if eligibility == Eligibility::Eligible {
            Vec::new()
        } else {
            self.suggest_alternatives(profile, policy)
        };

        Ok(RiskAssessment {
            match_score,
            eligibility,
            affordability_ratio: ratio,
            risk_level,
            risk_reason,
            alternatives,
        })
    }
}

// ── Failure doubles ──────────────────────────────────────────────────

/// Scorer that always fails. Useful for degradation testing.
#[derive(Debug, Clone)]
pub struct UnavailableScorer {
    reason: String,
}

impl UnavailableScorer {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl RiskScorer for UnavailableScorer {
    async fn score(
        &self,
        _profile: &UserProfile,
        _policy: Option<&PolicySummary>,
    ) -> Result<RiskAssessment, BrokerError> {
        Err(BrokerError::Unavailable(self.reason.clone()))
    }
}

/// Scorer that never answers, for exercising the engine's timeout path.
#[derive(Debug, Clone, Default)]
pub struct StalledScorer;

#[async_trait]
impl RiskScorer for StalledScorer {
    async fn score(
        &self,
        _profile: &UserProfile,
        _policy: Option<&PolicySummary>,
    ) -> Result<RiskAssessment, BrokerError> {
        std::future::pending::<()>().await;
        unreachable!("pending future never resolves")
    }
}

// ── Notification sink ────────────────────────────────────────────────

/// A user-facing notification produced from a domain event.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Notification {
    pub id: String,
    pub user_id: UserId,
    pub event_kind: String,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

/// In-memory per-user notification buffer backing the polling endpoint.
///
/// Delivery stays outside the state machine: the sink renders whatever
/// events arrive and the frontend polls at its own pace.
#[derive(Debug, Default)]
pub struct BufferedNotificationSink {
    inner: Mutex<Vec<Notification>>,
}

impl BufferedNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_user(&self, user_id: &UserId) -> Vec<Notification> {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner
            .iter()
            .filter(|n| &n.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn mark_read(&self, user_id: &UserId) {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for notification in inner.iter_mut().filter(|n| &n.user_id == user_id) {
            notification.read = true;
        }
    }

    pub fn unread_count(&self, user_id: &UserId) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner
            .iter()
            .filter(|n| &n.user_id == user_id && !n.read)
            .count()
    }

    fn render(event: &DomainEvent) -> Option<(String, String)> {
        let pair = match event {
            DomainEvent::BookingCreated { booking } => (
                "Consultation requested".to_string(),
                format!("Your consultation request {} is awaiting agent review.", booking.id),
            ),
            DomainEvent::BookingDecided { booking, action } => match action {
                BookingAction::Approve => (
                    "Consultation approved".to_string(),
                    format!(
                        "Your consultation {} was approved. Meeting link: {}.",
                        booking.id,
                        booking.meeting_link.as_deref().unwrap_or("to follow")
                    ),
                ),
                BookingAction::Reject => (
                    "Consultation rejected".to_string(),
                    format!(
                        "Your consultation {} was rejected: {}.",
                        booking.id,
                        booking.rejection_reason.as_deref().unwrap_or("no reason given")
                    ),
                ),
                BookingAction::Complete => (
                    "Consultation completed".to_string(),
                    format!("Your consultation {} is complete.", booking.id),
                ),
                BookingAction::Expire => (
                    "Consultation expired".to_string(),
                    format!("Your consultation {} expired without a decision.", booking.id),
                ),
            },
            DomainEvent::BookingCancelled { booking } => (
                "Consultation cancelled".to_string(),
                format!("Your consultation {} was cancelled.", booking.id),
            ),
            DomainEvent::BookingExpired { booking } => (
                "Consultation expired".to_string(),
                format!("Your consultation {} expired without a decision.", booking.id),
            ),
            DomainEvent::PolicyIssued { policy } => (
                "Policy ready for payment".to_string(),
                format!("Policy {} was issued; payment completes activation.", policy.id),
            ),
            DomainEvent::PolicyActivated { policy } => (
                "Policy active".to_string(),
                format!("Policy {} is now active.", policy.id),
            ),
            DomainEvent::PolicyRenewed { policy } => (
                "Policy renewed".to_string(),
                format!("Policy {} was renewed.", policy.id),
            ),
            DomainEvent::CaseOpened { case } => (
                "Case opened".to_string(),
                format!("Your case {} was opened and is pending review.", case.case_id),
            ),
            DomainEvent::CaseResolved { case } => (
                "Case resolved".to_string(),
                format!("Your case {} was resolved.", case.case_id),
            ),
            DomainEvent::AgentStatusChanged { .. } => return None,
        };
        Some(pair)
    }
}

#[async_trait]
impl EventSink for BufferedNotificationSink {
    async fn publish(&self, event: DomainEvent) {
        let Some(user_id) = event.user_id().cloned() else {
            return;
        };
        let Some((title, body)) = Self::render(&event) else {
            return;
        };

        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.push(Notification {
            id: Uuid::new_v4().to_string(),
            user_id,
            event_kind: event.kind().to_string(),
            title,
            body,
            created_at: Utc::now(),
            read: false,
        });
    }
}
