use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

// ── Identifiers ──────────────────────────────────────────────────────

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn generate() -> Self {
                Self(format!("{}-{}", $prefix, Uuid::new_v4()))
            }

            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(/// Unique identifier for a consultation booking.
    BookingId, "bkg");
string_id!(/// Unique identifier for an issued user policy instance.
    UserPolicyId, "upl");
string_id!(/// Unique identifier for an exception/escalation case.
    CaseId, "case");
string_id!(/// Identifier of a platform user.
    UserId, "usr");
string_id!(/// Identifier of a brokerage agent.
    AgentId, "agt");
string_id!(/// Identifier of a catalog policy product.
    PolicyId, "pol");

// ── Booking ──────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingType {
    /// Consultation aimed at purchasing a specific catalog policy.
    Purchase,
    /// General enquiry with no candidate policy attached.
    Enquiry,
}

/// Lifecycle state of a booking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    #[default]
    Pending,
    Approved,
    Completed,
    Rejected,
    Expired,
    Cancelled,
}

impl BookingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Rejected | Self::Expired | Self::Cancelled
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Agent-side decision applied to a booking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingAction {
    Approve,
    Reject,
    Complete,
    Expire,
}

impl BookingAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Complete => "complete",
            Self::Expire => "expire",
        }
    }
}

/// A scheduled consultation slot between a user and an agent, optionally
/// tied to a candidate catalog policy.
///
/// Exactly one agent owns a booking for its whole life; `policy_id` is
/// immutable once set. All mutations go through the engine so the version
/// field linearizes concurrent writers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    /// Optimistic-concurrency version, bumped by the store on every update.
    pub version: u64,
    pub user_id: UserId,
    pub agent_id: AgentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<PolicyId>,
    pub booking_type: BookingType,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub reason: String,
    pub status: BookingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    /// Advisory narrative from the risk scorer; absent when the scorer
    /// was unavailable at decision time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_analysis: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meeting_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_notes: Option<String>,
    /// SLA deadline for the first agent response. Informational.
    pub respond_by: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Booking {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: UserId,
        agent_id: AgentId,
        booking_type: BookingType,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        reason: impl Into<String>,
        respond_by: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: BookingId::generate(),
            version: 0,
            user_id,
            agent_id,
            policy_id: None,
            booking_type,
            start_time,
            end_time,
            reason: reason.into(),
            status: BookingStatus::Pending,
            rejection_reason: None,
            ai_analysis: None,
            risk_score: None,
            meeting_link: None,
            agent_notes: None,
            respond_by,
            created_at: now,
            updated_at: now,
            responded_at: None,
            completed_at: None,
        }
    }

    pub fn with_policy(mut self, policy_id: PolicyId) -> Self {
        self.policy_id = Some(policy_id);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// First agent response arrived within the SLA window.
    pub fn responded_in_sla(&self) -> Option<bool> {
        self.responded_at.map(|at| at <= self.respond_by)
    }

    pub(crate) fn mark_approved(&mut self, meeting_link: String, notes: Option<String>) {
        let now = Utc::now();
        self.status = BookingStatus::Approved;
        self.meeting_link = Some(meeting_link);
        self.agent_notes = notes;
        self.responded_at.get_or_insert(now);
        self.updated_at = now;
    }

    pub(crate) fn mark_rejected(&mut self, reason: String, notes: Option<String>) {
        let now = Utc::now();
        self.status = BookingStatus::Rejected;
        self.rejection_reason = Some(reason);
        if notes.is_some() {
            self.agent_notes = notes;
        }
        self.responded_at.get_or_insert(now);
        self.updated_at = now;
    }

    pub(crate) fn mark_completed(&mut self, notes: Option<String>) {
        let now = Utc::now();
        self.status = BookingStatus::Completed;
        if notes.is_some() {
            self.agent_notes = notes;
        }
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn mark_expired(&mut self) {
        self.status = BookingStatus::Expired;
        self.updated_at = Utc::now();
    }

    pub(crate) fn mark_cancelled(&mut self) {
        self.status = BookingStatus::Cancelled;
        self.updated_at = Utc::now();
    }
}

// ── User policy ──────────────────────────────────────────────────────

/// Billing state of an issued policy instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStatus {
    Quoted,
    PaymentPending,
    Active,
    Rejected,
}

impl PolicyStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Quoted => "quoted",
            Self::PaymentPending => "payment_pending",
            Self::Active => "active",
            Self::Rejected => "rejected",
        }
    }
}

/// Where the issuing workflow left the policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyWorkflowStatus {
    ConsultationPending,
    ConsultationCompleted,
    Approved,
    Rejected,
    AlternativesSuggested,
}

/// An instance of a catalog policy issued to a specific user.
///
/// `status = Active` requires `workflow_status = Approved` plus a payment
/// event, and never regresses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserPolicy {
    pub id: UserPolicyId,
    pub version: u64,
    pub user_id: UserId,
    pub policy_id: PolicyId,
    /// The booking this policy was issued from, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<BookingId>,
    /// Annual premium in minor currency units.
    pub premium_minor: u64,
    /// Length of one coverage period.
    pub tenure_months: u32,
    pub status: PolicyStatus,
    pub workflow_status: PolicyWorkflowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation_note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternative_policy_ids: Vec<PolicyId>,
    pub renewed_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserPolicy {
    pub fn new(
        user_id: UserId,
        policy_id: PolicyId,
        premium_minor: u64,
        tenure_months: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: UserPolicyId::generate(),
            version: 0,
            user_id,
            policy_id,
            booking_id: None,
            premium_minor,
            tenure_months,
            status: PolicyStatus::PaymentPending,
            workflow_status: PolicyWorkflowStatus::Approved,
            start_date: None,
            end_date: None,
            recommendation_note: None,
            agent_notes: None,
            rejection_reason: None,
            alternative_policy_ids: Vec::new(),
            renewed_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn from_booking(mut self, booking_id: BookingId) -> Self {
        self.booking_id = Some(booking_id);
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == PolicyStatus::Active
    }
}

// ── Exception case ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseType {
    EscalatedRejection,
    DisputedClaim,
    AgentMisconduct,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CasePriority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    #[default]
    Pending,
    UnderReview,
    Resolved,
    Closed,
}

impl CaseStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::UnderReview => "under_review",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
        }
    }
}

/// Outcome recorded when a case is resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTaken {
    Approved,
    Rejected,
    AgentWarned,
    AgentSuspended,
    PolicyModified,
}

/// An out-of-band dispute/escalation record requiring privileged
/// resolution. Append-only: cases are archived via `Closed`, never
/// deleted, and the resolution pair is written exactly once.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExceptionCase {
    pub case_id: CaseId,
    pub version: u64,
    pub case_type: CaseType,
    pub priority: CasePriority,
    pub is_urgent: bool,
    pub user_id: UserId,
    pub agent_id: AgentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<PolicyId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<BookingId>,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_complaint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_response: Option<String>,
    pub status: CaseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_taken: Option<ActionTaken>,
    pub requires_legal_review: bool,
    pub requires_compliance_review: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExceptionCase {
    pub fn new(
        case_type: CaseType,
        priority: CasePriority,
        user_id: UserId,
        agent_id: AgentId,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            case_id: CaseId::generate(),
            version: 0,
            case_type,
            priority,
            is_urgent: priority >= CasePriority::High,
            user_id,
            agent_id,
            policy_id: None,
            booking_id: None,
            description: description.into(),
            user_complaint: None,
            agent_response: None,
            status: CaseStatus::Pending,
            resolution: None,
            action_taken: None,
            requires_legal_review: false,
            requires_compliance_review: case_type == CaseType::AgentMisconduct,
            resolved_by: None,
            resolved_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_booking(mut self, booking_id: BookingId) -> Self {
        self.booking_id = Some(booking_id);
        self
    }

    pub fn with_policy(mut self, policy_id: PolicyId) -> Self {
        self.policy_id = Some(policy_id);
        self
    }

    pub fn with_complaint(mut self, complaint: impl Into<String>) -> Self {
        self.user_complaint = Some(complaint.into());
        self
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status, CaseStatus::Pending | CaseStatus::UnderReview)
    }
}

// ── Agent profile ────────────────────────────────────────────────────

/// Governance and performance record of a brokerage agent.
///
/// The metric fields are recomputed by the engine as decisions and cases
/// land; callers can only toggle activation and assignments.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentProfile {
    pub agent_id: AgentId,
    pub version: u64,
    pub display_name: String,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deactivation_reason: Option<String>,
    /// Regions this agent may serve. Empty means unrestricted.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub assigned_regions: BTreeSet<String>,
    /// Policy types this agent may handle. Empty means unrestricted.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub assigned_policy_types: BTreeSet<String>,
    pub sla_breaches: u32,
    pub decided_count: u32,
    pub approved_count: u32,
    pub approval_rate: f32,
    pub misconduct_flags: u32,
    pub escalated_cases: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentProfile {
    pub fn new(agent_id: AgentId, display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            agent_id,
            version: 0,
            display_name: display_name.into(),
            is_active: true,
            deactivation_reason: None,
            assigned_regions: BTreeSet::new(),
            assigned_policy_types: BTreeSet::new(),
            sla_breaches: 0,
            decided_count: 0,
            approved_count: 0,
            approval_rate: 0.0,
            misconduct_flags: 0,
            escalated_cases: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn record_decision(&mut self, approved: bool) {
        self.decided_count += 1;
        if approved {
            self.approved_count += 1;
        }
        self.approval_rate = self.approved_count as f32 / self.decided_count as f32;
        self.updated_at = Utc::now();
    }
}

// ── Collaborator inputs ──────────────────────────────────────────────

/// Minimal user facts the risk scorer consumes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub full_name: String,
    pub age: u32,
    pub annual_income_minor: u64,
    pub region: String,
    pub dependents: u32,
    pub smoker: bool,
}

impl UserProfile {
    /// Placeholder profile for users the platform has no facts about yet.
    /// Scoring such a user yields a conservative advisory result.
    pub fn unknown(user_id: UserId) -> Self {
        Self {
            user_id,
            full_name: String::new(),
            age: 0,
            annual_income_minor: 0,
            region: "unknown".to_string(),
            dependents: 0,
            smoker: false,
        }
    }
}

/// Catalog policy product summary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicySummary {
    pub policy_id: PolicyId,
    pub name: String,
    pub policy_type: String,
    pub annual_premium_minor: u64,
    pub coverage_minor: u64,
    pub min_age: u32,
    pub max_age: u32,
    pub tenure_months: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_booking() -> Booking {
        let now = Utc::now();
        Booking::new(
            UserId::new("usr-1"),
            AgentId::new("agt-9"),
            BookingType::Enquiry,
            now + Duration::hours(24),
            now + Duration::hours(25),
            "income review",
            now + Duration::hours(12),
        )
    }

    #[test]
    fn new_booking_starts_pending() {
        let booking = make_booking();
        assert_eq!(booking.status, BookingStatus::Pending);
        assert_eq!(booking.version, 0);
        assert!(!booking.is_terminal());
        assert!(booking.responded_in_sla().is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!BookingStatus::Pending.is_terminal());
        assert!(!BookingStatus::Approved.is_terminal());
        assert!(BookingStatus::Completed.is_terminal());
        assert!(BookingStatus::Rejected.is_terminal());
        assert!(BookingStatus::Expired.is_terminal());
        assert!(BookingStatus::Cancelled.is_terminal());
    }

    #[test]
    fn rejection_stamps_reason_and_response_time() {
        let mut booking = make_booking();
        booking.mark_rejected("income mismatch".to_string(), None);
        assert_eq!(booking.status, BookingStatus::Rejected);
        assert_eq!(booking.rejection_reason.as_deref(), Some("income mismatch"));
        assert!(booking.responded_at.is_some());
        assert_eq!(booking.responded_in_sla(), Some(true));
    }

    #[test]
    fn approval_rate_recomputed() {
        let mut agent = AgentProfile::new(AgentId::new("agt-1"), "Dana");
        agent.record_decision(true);
        agent.record_decision(true);
        agent.record_decision(false);
        assert_eq!(agent.decided_count, 3);
        assert!((agent.approval_rate - 2.0 / 3.0).abs() < f32::EPSILON);
    }

    #[test]
    fn misconduct_case_requires_compliance_review() {
        let case = ExceptionCase::new(
            CaseType::AgentMisconduct,
            CasePriority::High,
            UserId::new("usr-1"),
            AgentId::new("agt-1"),
            "rude during consultation",
        );
        assert!(case.requires_compliance_review);
        assert!(case.is_urgent);
        assert!(case.is_open());
    }

    #[test]
    fn id_display_round_trip() {
        let id = BookingId::generate();
        assert!(id.as_str().starts_with("bkg-"));
        let named = CaseId::new("case-7");
        assert_eq!(named.to_string(), "case-7");
    }
}
