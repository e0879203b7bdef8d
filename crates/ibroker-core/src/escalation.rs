//! Exception/escalation desk.
//!
//! Escalation is explicit: a disputed rejection or a conduct complaint
//! becomes an `ExceptionCase` with its own forward-only lifecycle,
//! resolved by a privileged role. Cases are an append-only audit
//! population: closing archives them, nothing deletes them.

use crate::audit::SharedAudit;
use crate::error::BrokerError;
use crate::events::{DomainEvent, EventSink};
use crate::governance::AgentGovernance;
use crate::lifecycle::case_transition;
use crate::store::SharedStore;
use crate::types::{
    ActionTaken, BookingId, BookingStatus, CaseId, CasePriority, CaseStatus, CaseType,
    ExceptionCase, PolicyStatus, UserPolicyId,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

/// Manually opened case, e.g. a conduct complaint or claim dispute.
#[derive(Debug, Clone)]
pub struct OpenCaseRequest {
    pub case_type: CaseType,
    pub priority: CasePriority,
    pub user_id: crate::types::UserId,
    pub agent_id: crate::types::AgentId,
    pub policy_id: Option<crate::types::PolicyId>,
    pub booking_id: Option<BookingId>,
    pub description: String,
    pub complaint: Option<String>,
}

#[derive(Clone)]
pub struct ExceptionDesk {
    store: SharedStore,
    governance: AgentGovernance,
    events: Arc<dyn EventSink>,
    audit: SharedAudit,
}

impl ExceptionDesk {
    pub fn new(
        store: SharedStore,
        governance: AgentGovernance,
        events: Arc<dyn EventSink>,
        audit: SharedAudit,
    ) -> Self {
        Self {
            store,
            governance,
            events,
            audit,
        }
    }

    /// User disputes a rejected booking.
    ///
    /// Priority tracks the advisory risk score attached at rejection
    /// time: a high-risk rejection dispute goes to the top of the queue.
    pub async fn escalate_rejection(
        &self,
        booking_id: &BookingId,
        complaint: impl Into<String>,
    ) -> Result<ExceptionCase, BrokerError> {
        let complaint = non_empty(complaint.into(), "complaint")?;
        let booking = self.store.get_booking(booking_id).await?;
        if booking.status != BookingStatus::Rejected {
            return Err(BrokerError::Validation(format!(
                "booking {booking_id} is not rejected; only rejections can be disputed"
            )));
        }

        let priority = match booking.risk_score {
            Some(score) if score >= 0.7 => CasePriority::High,
            _ => CasePriority::Medium,
        };

        let mut case = ExceptionCase::new(
            CaseType::EscalatedRejection,
            priority,
            booking.user_id.clone(),
            booking.agent_id.clone(),
            format!(
                "user disputes rejection of booking {booking_id}: {}",
                booking.rejection_reason.as_deref().unwrap_or("no reason recorded")
            ),
        )
        .with_booking(booking.id.clone())
        .with_complaint(complaint);
        if let Some(policy_id) = booking.policy_id.clone() {
            case = case.with_policy(policy_id);
        }

        self.open(case).await
    }

    /// User disputes a rejected policy issuance.
    pub async fn escalate_policy_rejection(
        &self,
        user_policy_id: &UserPolicyId,
        complaint: impl Into<String>,
    ) -> Result<ExceptionCase, BrokerError> {
        let complaint = non_empty(complaint.into(), "complaint")?;
        let policy = self.store.get_user_policy(user_policy_id).await?;
        if policy.status != PolicyStatus::Rejected {
            return Err(BrokerError::Validation(format!(
                "user policy {user_policy_id} is not rejected; only rejections can be disputed"
            )));
        }

        let agent_id = match &policy.booking_id {
            Some(booking_id) => self.store.get_booking(booking_id).await?.agent_id,
            None => {
                return Err(BrokerError::Validation(format!(
                    "user policy {user_policy_id} has no originating booking to dispute"
                )))
            }
        };

        let mut case = ExceptionCase::new(
            CaseType::EscalatedRejection,
            CasePriority::Medium,
            policy.user_id.clone(),
            agent_id,
            format!("user disputes rejected policy {user_policy_id}"),
        )
        .with_policy(policy.policy_id.clone())
        .with_complaint(complaint);
        if let Some(booking_id) = policy.booking_id.clone() {
            case = case.with_booking(booking_id);
        }

        self.open(case).await
    }

    /// Manual path: conduct complaints and claim disputes.
    pub async fn open_case(&self, request: OpenCaseRequest) -> Result<ExceptionCase, BrokerError> {
        let description = non_empty(request.description, "description")?;

        let mut case = ExceptionCase::new(
            request.case_type,
            request.priority,
            request.user_id,
            request.agent_id,
            description,
        );
        if let Some(policy_id) = request.policy_id {
            case = case.with_policy(policy_id);
        }
        if let Some(booking_id) = request.booking_id {
            case = case.with_booking(booking_id);
        }
        if let Some(complaint) = request.complaint {
            case = case.with_complaint(complaint);
        }

        self.open(case).await
    }

    /// PENDING → UNDER_REVIEW. A direct resolve may skip this.
    pub async fn begin_review(
        &self,
        case_id: &CaseId,
        reviewer: &str,
    ) -> Result<ExceptionCase, BrokerError> {
        let mut case = self.store.get_case(case_id).await?;
        case.status = case_transition(case_id.as_str(), case.status, CaseStatus::UnderReview)?;
        case.updated_at = Utc::now();
        let stored = self.store.update_case(case).await?;

        self.audit.lock().await.append(
            case_id.as_str(),
            "case_review_started",
            serde_json::json!({ "reviewer": reviewer }),
        );
        Ok(stored)
    }

    /// Privileged one-way resolution. Resolution text and the action are
    /// written together, exactly once; the record is immutable afterward.
    pub async fn resolve(
        &self,
        case_id: &CaseId,
        resolution: impl Into<String>,
        action_taken: ActionTaken,
        resolved_by: &str,
    ) -> Result<ExceptionCase, BrokerError> {
        let resolution = non_empty(resolution.into(), "resolution")?;
        if resolved_by.trim().is_empty() {
            return Err(BrokerError::Validation(
                "resolver identity is required".to_string(),
            ));
        }

        let mut case = self.store.get_case(case_id).await?;
        case.status = case_transition(case_id.as_str(), case.status, CaseStatus::Resolved)?;
        case.resolution = Some(resolution);
        case.action_taken = Some(action_taken);
        case.resolved_by = Some(resolved_by.trim().to_string());
        case.resolved_at = Some(Utc::now());
        case.updated_at = Utc::now();
        let stored = self.store.update_case(case).await?;

        if action_taken == ActionTaken::AgentSuspended {
            self.governance
                .suspend_for_case(&stored.agent_id, case_id.as_str())
                .await?;
        }

        self.audit.lock().await.append(
            case_id.as_str(),
            "case_resolved",
            serde_json::json!({
                "action_taken": action_taken,
                "resolved_by": stored.resolved_by,
            }),
        );
        self.events
            .publish(DomainEvent::CaseResolved {
                case: stored.clone(),
            })
            .await;
        info!(case = %case_id, action = ?action_taken, "exception case resolved");
        Ok(stored)
    }

    /// RESOLVED → CLOSED: archive, never delete.
    pub async fn close(&self, case_id: &CaseId) -> Result<ExceptionCase, BrokerError> {
        let mut case = self.store.get_case(case_id).await?;
        case.status = case_transition(case_id.as_str(), case.status, CaseStatus::Closed)?;
        case.updated_at = Utc::now();
        let stored = self.store.update_case(case).await?;
        self.audit
            .lock()
            .await
            .append(case_id.as_str(), "case_closed", serde_json::json!({}));
        Ok(stored)
    }

    pub async fn get(&self, case_id: &CaseId) -> Result<ExceptionCase, BrokerError> {
        self.store.get_case(case_id).await
    }

    pub async fn list(&self, only_open: bool) -> Result<Vec<ExceptionCase>, BrokerError> {
        self.store.list_cases(only_open).await
    }

    async fn open(&self, case: ExceptionCase) -> Result<ExceptionCase, BrokerError> {
        let stored = self.store.insert_case(case).await?;

        match stored.case_type {
            CaseType::EscalatedRejection | CaseType::DisputedClaim => {
                self.governance.note_escalation(&stored.agent_id).await?;
            }
            CaseType::AgentMisconduct => {
                self.governance.note_misconduct(&stored.agent_id).await?;
            }
        }

        self.audit.lock().await.append(
            stored.case_id.as_str(),
            "case_opened",
            serde_json::json!({
                "case_type": stored.case_type,
                "priority": stored.priority,
                "agent_id": stored.agent_id,
            }),
        );
        self.events
            .publish(DomainEvent::CaseOpened {
                case: stored.clone(),
            })
            .await;
        info!(case = %stored.case_id, kind = ?stored.case_type, "exception case opened");
        Ok(stored)
    }
}

fn non_empty(value: String, field: &str) -> Result<String, BrokerError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(BrokerError::Validation(format!("{field} must not be empty")))
    } else {
        Ok(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditTrail;
    use crate::events::NullSink;
    use crate::store::MemoryStore;
    use crate::types::{AgentId, AgentProfile, UserId};
    use tokio::sync::Mutex;

    async fn desk_with_agent() -> (ExceptionDesk, SharedStore) {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let governance = AgentGovernance::new(store.clone());
        governance
            .register(AgentProfile::new(AgentId::new("agt-1"), "Sam"))
            .await
            .unwrap();
        let desk = ExceptionDesk::new(
            store.clone(),
            governance,
            Arc::new(NullSink),
            Arc::new(Mutex::new(AuditTrail::new())),
        );
        (desk, store)
    }

    fn misconduct_request() -> OpenCaseRequest {
        OpenCaseRequest {
            case_type: CaseType::AgentMisconduct,
            priority: CasePriority::Critical,
            user_id: UserId::new("usr-1"),
            agent_id: AgentId::new("agt-1"),
            policy_id: None,
            booking_id: None,
            description: "pressured user into costlier cover".to_string(),
            complaint: Some("agent would not take no".to_string()),
        }
    }

    #[tokio::test]
    async fn misconduct_case_flags_agent() {
        let (desk, store) = desk_with_agent().await;
        let case = desk.open_case(misconduct_request()).await.unwrap();
        assert_eq!(case.status, CaseStatus::Pending);
        assert!(case.is_urgent);

        let agent = store.get_agent(&AgentId::new("agt-1")).await.unwrap();
        assert_eq!(agent.misconduct_flags, 1);
    }

    #[tokio::test]
    async fn resolve_requires_resolution_text() {
        let (desk, _) = desk_with_agent().await;
        let case = desk.open_case(misconduct_request()).await.unwrap();

        let err = desk
            .resolve(&case.case_id, "   ", ActionTaken::AgentWarned, "admin-1")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Validation(_)));

        // Nothing was defaulted: the case is still open.
        let unchanged = desk.get(&case.case_id).await.unwrap();
        assert_eq!(unchanged.status, CaseStatus::Pending);
        assert!(unchanged.resolution.is_none());
    }

    #[tokio::test]
    async fn suspension_cascades_to_agent_profile() {
        let (desk, store) = desk_with_agent().await;
        let case = desk.open_case(misconduct_request()).await.unwrap();
        desk.resolve(
            &case.case_id,
            "repeated complaints upheld",
            ActionTaken::AgentSuspended,
            "admin-1",
        )
        .await
        .unwrap();

        let agent = store.get_agent(&AgentId::new("agt-1")).await.unwrap();
        assert!(!agent.is_active);
        let reason = agent.deactivation_reason.unwrap_or_default();
        assert!(reason.contains(case.case_id.as_str()));
    }

    #[tokio::test]
    async fn resolution_is_write_once() {
        let (desk, _) = desk_with_agent().await;
        let case = desk.open_case(misconduct_request()).await.unwrap();
        desk.resolve(&case.case_id, "warned", ActionTaken::AgentWarned, "admin-1")
            .await
            .unwrap();

        let err = desk
            .resolve(&case.case_id, "changed my mind", ActionTaken::Approved, "admin-2")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::TerminalState { .. }));
    }

    #[tokio::test]
    async fn full_case_lifecycle_with_review() {
        let (desk, _) = desk_with_agent().await;
        let case = desk.open_case(misconduct_request()).await.unwrap();

        let case = desk.begin_review(&case.case_id, "admin-1").await.unwrap();
        assert_eq!(case.status, CaseStatus::UnderReview);

        let case = desk
            .resolve(&case.case_id, "no fault found", ActionTaken::Rejected, "admin-1")
            .await
            .unwrap();
        assert_eq!(case.status, CaseStatus::Resolved);

        let case = desk.close(&case.case_id).await.unwrap();
        assert_eq!(case.status, CaseStatus::Closed);
    }
}
