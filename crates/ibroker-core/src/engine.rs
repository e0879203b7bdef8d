//! The workflow engine: booking and policy lifecycles under one roof.
//!
//! Each public operation is a short-lived unit of work: validate, gate
//! through governance, apply the transition table, persist through the
//! store's optimistic version check, then fan out audit entries and
//! domain events. The scorer is advisory and bounded by a timeout; the
//! store is authoritative and its failures abort the operation.

use crate::audit::{AuditEntry, AuditTrail, SharedAudit};
use crate::error::BrokerError;
use crate::escalation::{ExceptionDesk, OpenCaseRequest};
use crate::events::{DomainEvent, EventSink};
use crate::governance::AgentGovernance;
use crate::lifecycle::{booking_cancellation, booking_transition, policy_activation};
use crate::scorer::{RiskAssessment, RiskScorer};
use crate::store::{bootstrap_store, BookingFilter, SharedStore, StoreConfig};
use crate::types::{
    ActionTaken, AgentId, AgentProfile, Booking, BookingAction, BookingId, BookingStatus,
    BookingType, CaseId, ExceptionCase, PolicyId, PolicyStatus, PolicySummary,
    PolicyWorkflowStatus, UserId, UserPolicy, UserPolicyId, UserProfile,
};
use chrono::{DateTime, Duration, Months, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Engine tunables. Defaults suit a single-region brokerage.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// SLA window for the first agent response to a pending booking.
    pub sla_response_hours: i64,
    /// Length of one coverage period stamped at activation.
    pub tenure_months: u32,
    /// Renewal opens this close to the policy end date.
    pub renewal_window_days: i64,
    /// Upper bound on one scorer call; expiry degrades to no AI data.
    pub scorer_timeout: StdDuration,
    /// Base URL for generated consultation meeting links.
    pub meeting_link_base: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            sla_response_hours: 24,
            tenure_months: 12,
            renewal_window_days: 30,
            scorer_timeout: StdDuration::from_secs(2),
            meeting_link_base: "https://meet.ibroker.example".to_string(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CreateBookingRequest {
    pub user_id: UserId,
    pub agent_id: AgentId,
    pub booking_type: BookingType,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub reason: String,
    #[serde(default)]
    pub policy_id: Option<PolicyId>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct DecisionRequest {
    pub booking_id: BookingId,
    pub agent_id: AgentId,
    pub action: BookingAction,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
}

/// Result of an agent decision: the booking after the transition, plus
/// the user policy the decision produced, when it produced one.
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub booking: Booking,
    pub user_policy: Option<UserPolicy>,
}

/// Owns the booking/policy state machines and their invariants.
pub struct WorkflowEngine {
    store: SharedStore,
    scorer: Arc<dyn RiskScorer>,
    events: Arc<dyn EventSink>,
    audit: SharedAudit,
    governance: AgentGovernance,
    desk: ExceptionDesk,
    catalog: RwLock<HashMap<PolicyId, PolicySummary>>,
    profiles: RwLock<HashMap<UserId, UserProfile>>,
    /// Latest advisory assessment per booking, for the insights endpoint.
    insights: RwLock<HashMap<BookingId, RiskAssessment>>,
    config: WorkflowConfig,
}

impl WorkflowEngine {
    /// Build an engine over a store resolved from configuration.
    pub async fn bootstrap(
        config: WorkflowConfig,
        store_config: StoreConfig,
        scorer: Arc<dyn RiskScorer>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, BrokerError> {
        let store = bootstrap_store(store_config).await?;
        Ok(Self::new(store, scorer, events, config))
    }

    pub fn new(
        store: SharedStore,
        scorer: Arc<dyn RiskScorer>,
        events: Arc<dyn EventSink>,
        config: WorkflowConfig,
    ) -> Self {
        let audit: SharedAudit = Arc::new(Mutex::new(AuditTrail::new()));
        let governance = AgentGovernance::new(store.clone());
        let desk = ExceptionDesk::new(
            store.clone(),
            governance.clone(),
            events.clone(),
            audit.clone(),
        );
        Self {
            store,
            scorer,
            events,
            audit,
            governance,
            desk,
            catalog: RwLock::new(HashMap::new()),
            profiles: RwLock::new(HashMap::new()),
            insights: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    // ── Registries ───────────────────────────────────────────────────

    pub async fn register_policy(&self, summary: PolicySummary) {
        self.catalog
            .write()
            .await
            .insert(summary.policy_id.clone(), summary);
    }

    pub async fn register_user_profile(&self, profile: UserProfile) {
        self.profiles
            .write()
            .await
            .insert(profile.user_id.clone(), profile);
    }

    pub async fn catalog_policy(&self, policy_id: &PolicyId) -> Option<PolicySummary> {
        self.catalog.read().await.get(policy_id).cloned()
    }

    pub async fn list_catalog(&self) -> Vec<PolicySummary> {
        let mut policies: Vec<PolicySummary> = self.catalog.read().await.values().cloned().collect();
        policies.sort_by(|a, b| a.policy_id.cmp(&b.policy_id));
        policies
    }

    // ── Booking lifecycle ────────────────────────────────────────────

    /// Create a booking, reserving the agent/slot pair exclusively.
    pub async fn create_booking(
        &self,
        request: CreateBookingRequest,
    ) -> Result<Booking, BrokerError> {
        if request.reason.trim().is_empty() {
            return Err(BrokerError::Validation(
                "a booking reason is required".to_string(),
            ));
        }
        if request.end_time <= request.start_time {
            return Err(BrokerError::Validation(
                "booking end must be after its start".to_string(),
            ));
        }
        let now = Utc::now();
        if request.start_time <= now {
            return Err(BrokerError::Validation(
                "booking slot must be in the future".to_string(),
            ));
        }

        let summary = match &request.policy_id {
            Some(policy_id) => Some(self.catalog_policy(policy_id).await.ok_or_else(|| {
                BrokerError::Validation(format!("unknown catalog policy {policy_id}"))
            })?),
            None => None,
        };
        let region = self
            .profiles
            .read()
            .await
            .get(&request.user_id)
            .map(|p| p.region.clone());

        self.gate_agent(
            &request.agent_id,
            summary.as_ref().map(|s| s.policy_type.as_str()),
            region.as_deref(),
        )
        .await?;

        let mut booking = Booking::new(
            request.user_id,
            request.agent_id,
            request.booking_type,
            request.start_time,
            request.end_time,
            request.reason.trim(),
            now + Duration::hours(self.config.sla_response_hours),
        );
        if let Some(policy_id) = request.policy_id {
            booking = booking.with_policy(policy_id);
        }

        let stored = self.store.insert_booking(booking).await?;
        self.audit_event(
            stored.id.as_str(),
            "booking_created",
            serde_json::json!({
                "agent_id": stored.agent_id,
                "start_time": stored.start_time,
                "booking_type": stored.booking_type,
            }),
        )
        .await;
        self.events
            .publish(DomainEvent::BookingCreated {
                booking: stored.clone(),
            })
            .await;
        info!(booking = %stored.id, agent = %stored.agent_id, "booking created");
        Ok(stored)
    }

    /// Apply an agent decision to a booking.
    ///
    /// The persist step is the linearization point: if another decision
    /// landed between our read and our write, the store rejects ours and
    /// no side effects run.
    pub async fn decide_booking(
        &self,
        request: DecisionRequest,
    ) -> Result<DecisionOutcome, BrokerError> {
        let mut booking = self.store.get_booking(&request.booking_id).await?;

        if booking.agent_id != request.agent_id {
            return Err(BrokerError::Validation(format!(
                "agent {} is not assigned to booking {}",
                request.agent_id, request.booking_id
            )));
        }
        if request.action == BookingAction::Expire && booking.status == BookingStatus::Pending {
            // Agent-driven expiry only retires approved consultations;
            // pending ones expire via the background sweep.
            return Err(BrokerError::terminal(
                format!("booking {}", booking.id),
                booking.status.name(),
            ));
        }

        let summary = match &booking.policy_id {
            Some(policy_id) => self.catalog_policy(policy_id).await,
            None => None,
        };
        let region = self
            .profiles
            .read()
            .await
            .get(&booking.user_id)
            .map(|p| p.region.clone());
        self.gate_agent(
            &request.agent_id,
            summary.as_ref().map(|s| s.policy_type.as_str()),
            region.as_deref(),
        )
        .await?;

        let next = booking_transition(booking.id.as_str(), booking.status, request.action)?;
        let mut assessment = None;

        match request.action {
            BookingAction::Approve => {
                let link = format!(
                    "{}/{}",
                    self.config.meeting_link_base.trim_end_matches('/'),
                    booking.id
                );
                booking.mark_approved(link, request.notes.clone());
            }
            BookingAction::Reject => {
                let reason = request
                    .rejection_reason
                    .as_deref()
                    .map(str::trim)
                    .unwrap_or("")
                    .to_string();
                if reason.is_empty() {
                    return Err(BrokerError::Validation(
                        "rejecting a booking requires a rejection reason".to_string(),
                    ));
                }
                assessment = self.advisory_score(&booking.user_id, summary.as_ref()).await;
                if let Some(assessment) = &assessment {
                    booking.risk_score = Some(assessment.risk_fraction());
                    booking.ai_analysis = Some(assessment.narrative());
                }
                booking.mark_rejected(reason, request.notes.clone());
            }
            BookingAction::Complete => {
                booking.mark_completed(request.notes.clone());
            }
            BookingAction::Expire => {
                booking.mark_expired();
            }
        }
        debug_assert_eq!(booking.status, next);

        let stored = self.store.update_booking(booking).await?;

        if let Some(assessment) = &assessment {
            self.insights
                .write()
                .await
                .insert(stored.id.clone(), assessment.clone());
        }

        match request.action {
            BookingAction::Approve => {
                self.governance.note_decision(&stored.agent_id, true).await?;
            }
            BookingAction::Reject => {
                self.governance
                    .note_decision(&stored.agent_id, false)
                    .await?;
            }
            _ => {}
        }

        let user_policy = match request.action {
            BookingAction::Complete => {
                self.issue_policy(&stored, summary, request.notes.clone())
                    .await?
            }
            BookingAction::Reject => {
                self.record_rejected_policy(&stored, summary, assessment.as_ref())
                    .await?
            }
            _ => None,
        };

        self.audit_event(
            stored.id.as_str(),
            &format!("booking_{}", next.name()),
            serde_json::json!({
                "action": request.action,
                "agent_id": stored.agent_id,
                "risk_score": stored.risk_score,
            }),
        )
        .await;
        self.events
            .publish(DomainEvent::BookingDecided {
                booking: stored.clone(),
                action: request.action,
            })
            .await;
        info!(
            booking = %stored.id,
            action = request.action.name(),
            status = stored.status.name(),
            "booking decided"
        );

        Ok(DecisionOutcome {
            booking: stored,
            user_policy,
        })
    }

    /// Withdraw a booking. Only the owning user, only pre-terminal, only
    /// before the slot starts.
    pub async fn cancel_booking(
        &self,
        booking_id: &BookingId,
        by_user: &UserId,
    ) -> Result<Booking, BrokerError> {
        let mut booking = self.store.get_booking(booking_id).await?;
        if &booking.user_id != by_user {
            return Err(BrokerError::Validation(format!(
                "user {by_user} does not own booking {booking_id}"
            )));
        }
        booking_cancellation(booking_id.as_str(), booking.status)?;
        if booking.start_time <= Utc::now() {
            return Err(BrokerError::terminal(
                format!("booking {booking_id}"),
                "already started",
            ));
        }

        booking.mark_cancelled();
        let stored = self.store.update_booking(booking).await?;
        self.audit_event(stored.id.as_str(), "booking_cancelled", serde_json::json!({}))
            .await;
        self.events
            .publish(DomainEvent::BookingCancelled {
                booking: stored.clone(),
            })
            .await;
        Ok(stored)
    }

    /// Background sweep: retire live bookings whose slot has passed.
    ///
    /// Safe to run concurrently with user-initiated decisions: a lost
    /// version race on any single booking is simply skipped; the next
    /// pass sees its final state.
    pub async fn expire_due_bookings(&self, now: DateTime<Utc>) -> Result<usize, BrokerError> {
        let due = self.store.bookings_due_for_expiry(now).await?;
        let mut expired = 0usize;

        for mut booking in due {
            if booking_transition(booking.id.as_str(), booking.status, BookingAction::Expire)
                .is_err()
            {
                continue;
            }
            let never_responded = booking.responded_at.is_none();
            booking.mark_expired();
            match self.store.update_booking(booking).await {
                Ok(stored) => {
                    expired += 1;
                    if never_responded {
                        self.governance.note_sla_breach(&stored.agent_id).await?;
                    }
                    self.audit_event(
                        stored.id.as_str(),
                        "booking_expired",
                        serde_json::json!({ "sla_breach": never_responded }),
                    )
                    .await;
                    self.events
                        .publish(DomainEvent::BookingExpired { booking: stored })
                        .await;
                }
                Err(BrokerError::Conflict(_)) | Err(BrokerError::NotFound(_)) => {
                    // Lost the race to a concurrent decision or sweep.
                    debug!("expiry sweep lost a race; skipping");
                }
                Err(other) => return Err(other),
            }
        }

        Ok(expired)
    }

    /// Advisory assessment attached at rejection time.
    pub async fn booking_insights(
        &self,
        booking_id: &BookingId,
    ) -> Result<RiskAssessment, BrokerError> {
        self.store.get_booking(booking_id).await?;
        self.insights
            .read()
            .await
            .get(booking_id)
            .cloned()
            .ok_or_else(|| {
                BrokerError::NotFound(format!("no insights recorded for booking {booking_id}"))
            })
    }

    pub async fn get_booking(&self, booking_id: &BookingId) -> Result<Booking, BrokerError> {
        self.store.get_booking(booking_id).await
    }

    pub async fn list_bookings(&self, filter: BookingFilter) -> Result<Vec<Booking>, BrokerError> {
        self.store.list_bookings(filter).await
    }

    // ── Policy lifecycle ─────────────────────────────────────────────

    /// Payment event from the billing collaborator. Idempotent: repeated
    /// calls on an active policy return it unchanged.
    pub async fn record_payment(
        &self,
        user_policy_id: &UserPolicyId,
    ) -> Result<UserPolicy, BrokerError> {
        let mut policy = self.store.get_user_policy(user_policy_id).await?;

        let next = policy_activation(user_policy_id.as_str(), policy.status)?;
        let Some(next) = next else {
            return Ok(policy);
        };
        if policy.workflow_status != PolicyWorkflowStatus::Approved {
            return Err(BrokerError::Validation(format!(
                "user policy {user_policy_id} was never approved by the workflow"
            )));
        }

        let now = Utc::now();
        policy.status = next;
        policy.start_date = Some(now);
        policy.end_date = Some(add_tenure(now, policy.tenure_months)?);
        policy.updated_at = now;
        let stored = self.store.update_user_policy(policy).await?;

        self.audit_event(
            stored.id.as_str(),
            "policy_activated",
            serde_json::json!({ "end_date": stored.end_date }),
        )
        .await;
        self.events
            .publish(DomainEvent::PolicyActivated {
                policy: stored.clone(),
            })
            .await;
        info!(policy = %stored.id, "user policy activated");
        Ok(stored)
    }

    /// Extend an active policy by one tenure period. Only allowed inside
    /// the renewal window.
    pub async fn renew_policy(
        &self,
        user_policy_id: &UserPolicyId,
    ) -> Result<UserPolicy, BrokerError> {
        let mut policy = self.store.get_user_policy(user_policy_id).await?;
        if policy.status != PolicyStatus::Active {
            return Err(BrokerError::NotRenewable(format!(
                "user policy {user_policy_id} is not active"
            )));
        }
        let end_date = policy.end_date.ok_or_else(|| {
            BrokerError::NotRenewable(format!("user policy {user_policy_id} has no end date"))
        })?;

        let now = Utc::now();
        if end_date - now >= Duration::days(self.config.renewal_window_days) {
            return Err(BrokerError::NotRenewable(format!(
                "renewal opens within {} days of expiry",
                self.config.renewal_window_days
            )));
        }

        policy.end_date = Some(add_tenure(end_date, policy.tenure_months)?);
        policy.renewed_count += 1;
        policy.updated_at = now;
        let stored = self.store.update_user_policy(policy).await?;

        self.audit_event(
            stored.id.as_str(),
            "policy_renewed",
            serde_json::json!({
                "renewed_count": stored.renewed_count,
                "end_date": stored.end_date,
            }),
        )
        .await;
        self.events
            .publish(DomainEvent::PolicyRenewed {
                policy: stored.clone(),
            })
            .await;
        Ok(stored)
    }

    pub async fn get_user_policy(
        &self,
        user_policy_id: &UserPolicyId,
    ) -> Result<UserPolicy, BrokerError> {
        self.store.get_user_policy(user_policy_id).await
    }

    pub async fn list_user_policies(
        &self,
        user_id: Option<&UserId>,
    ) -> Result<Vec<UserPolicy>, BrokerError> {
        self.store.list_user_policies(user_id).await
    }

    // ── Exceptions (delegated to the desk) ───────────────────────────

    pub async fn escalate_rejection(
        &self,
        booking_id: &BookingId,
        complaint: impl Into<String>,
    ) -> Result<ExceptionCase, BrokerError> {
        self.desk.escalate_rejection(booking_id, complaint).await
    }

    pub async fn escalate_policy_rejection(
        &self,
        user_policy_id: &UserPolicyId,
        complaint: impl Into<String>,
    ) -> Result<ExceptionCase, BrokerError> {
        self.desk
            .escalate_policy_rejection(user_policy_id, complaint)
            .await
    }

    pub async fn open_case(&self, request: OpenCaseRequest) -> Result<ExceptionCase, BrokerError> {
        self.desk.open_case(request).await
    }

    pub async fn begin_case_review(
        &self,
        case_id: &CaseId,
        reviewer: &str,
    ) -> Result<ExceptionCase, BrokerError> {
        self.desk.begin_review(case_id, reviewer).await
    }

    pub async fn resolve_case(
        &self,
        case_id: &CaseId,
        resolution: impl Into<String>,
        action_taken: ActionTaken,
        resolved_by: &str,
    ) -> Result<ExceptionCase, BrokerError> {
        self.desk
            .resolve(case_id, resolution, action_taken, resolved_by)
            .await
    }

    pub async fn close_case(&self, case_id: &CaseId) -> Result<ExceptionCase, BrokerError> {
        self.desk.close(case_id).await
    }

    pub async fn get_case(&self, case_id: &CaseId) -> Result<ExceptionCase, BrokerError> {
        self.desk.get(case_id).await
    }

    pub async fn list_cases(&self, only_open: bool) -> Result<Vec<ExceptionCase>, BrokerError> {
        self.desk.list(only_open).await
    }

    // ── Agents (delegated to governance) ─────────────────────────────

    pub async fn register_agent(&self, profile: AgentProfile) -> Result<AgentProfile, BrokerError> {
        self.governance.register(profile).await
    }

    pub async fn set_agent_active(
        &self,
        agent_id: &AgentId,
        active: bool,
        reason: Option<&str>,
    ) -> Result<AgentProfile, BrokerError> {
        let agent = self.governance.set_active(agent_id, active, reason).await?;
        self.events
            .publish(DomainEvent::AgentStatusChanged {
                agent: agent.clone(),
            })
            .await;
        Ok(agent)
    }

    pub async fn set_agent_assignments(
        &self,
        agent_id: &AgentId,
        regions: std::collections::BTreeSet<String>,
        policy_types: std::collections::BTreeSet<String>,
    ) -> Result<AgentProfile, BrokerError> {
        self.governance
            .set_assignments(agent_id, regions, policy_types)
            .await
    }

    pub async fn get_agent(&self, agent_id: &AgentId) -> Result<AgentProfile, BrokerError> {
        self.governance.get(agent_id).await
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentProfile>, BrokerError> {
        self.governance.list().await
    }

    // ── Audit ────────────────────────────────────────────────────────

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.lock().await.entries().to_vec()
    }

    pub async fn verify_audit_chain(&self) -> bool {
        self.audit.lock().await.verify_chain()
    }

    // ── Internal ─────────────────────────────────────────────────────

    async fn gate_agent(
        &self,
        agent_id: &AgentId,
        policy_type: Option<&str>,
        region: Option<&str>,
    ) -> Result<(), BrokerError> {
        if self
            .governance
            .can_assign(agent_id, policy_type, region)
            .await?
        {
            Ok(())
        } else {
            Err(BrokerError::AgentNotEligible(format!(
                "agent {agent_id} may not act on this booking"
            )))
        }
    }

    /// Bounded advisory call. Any failure degrades to `None`; the
    /// business transition never waits on a broken scorer.
    async fn advisory_score(
        &self,
        user_id: &UserId,
        summary: Option<&PolicySummary>,
    ) -> Option<RiskAssessment> {
        let profile = self
            .profiles
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| UserProfile::unknown(user_id.clone()));

        match tokio::time::timeout(self.config.scorer_timeout, self.scorer.score(&profile, summary))
            .await
        {
            Ok(Ok(assessment)) => Some(assessment),
            Ok(Err(err)) => {
                warn!(user = %user_id, error = %err, "risk scorer failed; proceeding without AI data");
                None
            }
            Err(_) => {
                warn!(user = %user_id, "risk scorer timed out; proceeding without AI data");
                None
            }
        }
    }

    /// COMPLETE on a purchase booking issues the policy instance.
    async fn issue_policy(
        &self,
        booking: &Booking,
        summary: Option<PolicySummary>,
        notes: Option<String>,
    ) -> Result<Option<UserPolicy>, BrokerError> {
        let Some(policy_id) = booking.policy_id.clone() else {
            return Ok(None);
        };
        let summary = summary.ok_or_else(|| {
            BrokerError::Validation(format!("unknown catalog policy {policy_id}"))
        })?;

        let mut policy = UserPolicy::new(
            booking.user_id.clone(),
            policy_id,
            summary.annual_premium_minor,
            summary.tenure_months.max(1),
        )
        .from_booking(booking.id.clone());
        policy.agent_notes = notes;
        policy.recommendation_note = booking.agent_notes.clone();

        let stored = self.store.insert_user_policy(policy).await?;
        self.audit_event(
            stored.id.as_str(),
            "policy_issued",
            serde_json::json!({
                "booking_id": booking.id,
                "premium_minor": stored.premium_minor,
            }),
        )
        .await;
        self.events
            .publish(DomainEvent::PolicyIssued {
                policy: stored.clone(),
            })
            .await;
        info!(policy = %stored.id, booking = %booking.id, "user policy issued");
        Ok(Some(stored))
    }

    /// REJECT on a purchase booking leaves a rejected policy record with
    /// the scorer's alternative suggestions, so the user sees what to try
    /// instead.
    async fn record_rejected_policy(
        &self,
        booking: &Booking,
        summary: Option<PolicySummary>,
        assessment: Option<&RiskAssessment>,
    ) -> Result<Option<UserPolicy>, BrokerError> {
        let Some(policy_id) = booking.policy_id.clone() else {
            return Ok(None);
        };
        let premium = summary.map(|s| s.annual_premium_minor).unwrap_or(0);

        let alternatives: Vec<PolicyId> = assessment
            .map(|a| a.alternatives.iter().map(|p| p.policy_id.clone()).collect())
            .unwrap_or_default();

        let mut policy = UserPolicy::new(
            booking.user_id.clone(),
            policy_id,
            premium,
            self.config.tenure_months,
        )
        .from_booking(booking.id.clone());
        policy.status = PolicyStatus::Rejected;
        policy.workflow_status = if alternatives.is_empty() {
            PolicyWorkflowStatus::Rejected
        } else {
            PolicyWorkflowStatus::AlternativesSuggested
        };
        policy.rejection_reason = booking.rejection_reason.clone();
        policy.alternative_policy_ids = alternatives;

        let stored = self.store.insert_user_policy(policy).await?;
        self.audit_event(
            stored.id.as_str(),
            "policy_rejected",
            serde_json::json!({
                "booking_id": booking.id,
                "alternatives": stored.alternative_policy_ids.len(),
            }),
        )
        .await;
        Ok(Some(stored))
    }

    async fn audit_event(&self, record_id: &str, event: &str, payload: serde_json::Value) {
        self.audit.lock().await.append(record_id, event, payload);
    }
}

fn add_tenure(from: DateTime<Utc>, tenure_months: u32) -> Result<DateTime<Utc>, BrokerError> {
    from.checked_add_months(Months::new(tenure_months.max(1)))
        .ok_or_else(|| BrokerError::Validation("tenure pushes end date out of range".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use crate::events::NullSink;
    use crate::scorer::{Eligibility, RiskLevel};
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct FixedScorer;

    #[async_trait]
    impl RiskScorer for FixedScorer {
        async fn score(
            &self,
            _profile: &UserProfile,
            policy: Option<&PolicySummary>,
        ) -> Result<RiskAssessment, BrokerError> {
            Ok(RiskAssessment {
                match_score: 35,
                eligibility: Eligibility::PartiallyEligible,
                affordability_ratio: 0.22,
                risk_level: RiskLevel::High,
                risk_reason: "income below policy band".to_string(),
                alternatives: policy
                    .map(|_| {
                        vec![PolicySummary {
                            policy_id: PolicyId::new("pol-basic"),
                            name: "Basic Shield".to_string(),
                            policy_type: "health".to_string(),
                            annual_premium_minor: 48_000,
                            coverage_minor: 20_000_000,
                            min_age: 18,
                            max_age: 70,
                            tenure_months: 12,
                        }]
                    })
                    .unwrap_or_default(),
            })
        }
    }

    struct BrokenScorer;

    #[async_trait]
    impl RiskScorer for BrokenScorer {
        async fn score(
            &self,
            _profile: &UserProfile,
            _policy: Option<&PolicySummary>,
        ) -> Result<RiskAssessment, BrokerError> {
            Err(BrokerError::Unavailable("scorer offline".to_string()))
        }
    }

    struct StalledScorer;

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

    fn catalog_policy(id: &str) -> PolicySummary {
        PolicySummary {
            policy_id: PolicyId::new(id),
            name: "Family Health Plus".to_string(),
            policy_type: "health".to_string(),
            annual_premium_minor: 120_000,
            coverage_minor: 50_000_000,
            min_age: 18,
            max_age: 65,
            tenure_months: 12,
        }
    }

    async fn engine_with(scorer: Arc<dyn RiskScorer>) -> (Arc<WorkflowEngine>, SharedStore) {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mut config = WorkflowConfig::default();
        config.scorer_timeout = StdDuration::from_millis(50);
        let engine = Arc::new(WorkflowEngine::new(
            store.clone(),
            scorer,
            Arc::new(NullSink),
            config,
        ));
        engine
            .register_agent(AgentProfile::new(AgentId::new("agt-9"), "Sam"))
            .await
            .unwrap();
        engine.register_policy(catalog_policy("pol-42")).await;
        engine
            .register_user_profile(UserProfile {
                user_id: UserId::new("usr-1"),
                full_name: "Jo Doe".to_string(),
                age: 34,
                annual_income_minor: 600_000,
                region: "north".to_string(),
                dependents: 1,
                smoker: false,
            })
            .await;
        (engine, store)
    }

    fn booking_request(policy: Option<&str>, start_hours: i64) -> CreateBookingRequest {
        let now = Utc::now();
        CreateBookingRequest {
            user_id: UserId::new("usr-1"),
            agent_id: AgentId::new("agt-9"),
            booking_type: policy
                .map(|_| BookingType::Purchase)
                .unwrap_or(BookingType::Enquiry),
            start_time: now + Duration::hours(start_hours),
            end_time: now + Duration::hours(start_hours + 1),
            reason: "consultation".to_string(),
            policy_id: policy.map(PolicyId::new),
        }
    }

    fn decision(booking: &Booking, action: BookingAction) -> DecisionRequest {
        DecisionRequest {
            booking_id: booking.id.clone(),
            agent_id: booking.agent_id.clone(),
            action,
            notes: None,
            rejection_reason: matches!(action, BookingAction::Reject)
                .then(|| "income mismatch".to_string()),
        }
    }

    #[tokio::test]
    async fn rejection_attaches_advisory_data_and_no_policy() {
        // Scenario: enquiry booking rejected with a reason.
        let (engine, _) = engine_with(Arc::new(FixedScorer)).await;
        let booking = engine.create_booking(booking_request(None, 24)).await.unwrap();

        let outcome = engine
            .decide_booking(decision(&booking, BookingAction::Reject))
            .await
            .unwrap();
        let rejected = outcome.booking;

        assert_eq!(rejected.status, BookingStatus::Rejected);
        assert_eq!(rejected.rejection_reason.as_deref(), Some("income mismatch"));
        assert!(rejected.risk_score.is_some());
        assert!(outcome.user_policy.is_none());
        assert!(engine.list_user_policies(None).await.unwrap().is_empty());
        assert!(engine.booking_insights(&rejected.id).await.is_ok());
        assert!(engine.verify_audit_chain().await);
    }

    #[tokio::test]
    async fn purchase_flow_issues_and_activates_policy() {
        // Scenario: purchase booking approved, completed, then paid.
        let (engine, _) = engine_with(Arc::new(FixedScorer)).await;
        let booking = engine
            .create_booking(booking_request(Some("pol-42"), 24))
            .await
            .unwrap();

        let approved = engine
            .decide_booking(decision(&booking, BookingAction::Approve))
            .await
            .unwrap()
            .booking;
        assert_eq!(approved.status, BookingStatus::Approved);
        assert!(approved.meeting_link.is_some());

        let outcome = engine
            .decide_booking(decision(&approved, BookingAction::Complete))
            .await
            .unwrap();
        let issued = outcome.user_policy.expect("policy issued on completion");
        assert_eq!(issued.status, PolicyStatus::PaymentPending);
        assert_eq!(issued.workflow_status, PolicyWorkflowStatus::Approved);
        assert_eq!(issued.premium_minor, 120_000);

        let active = engine.record_payment(&issued.id).await.unwrap();
        assert_eq!(active.status, PolicyStatus::Active);
        assert!(active.start_date.is_some());
        assert!(active.end_date.unwrap() > active.start_date.unwrap());

        // Idempotent: a duplicate payment event changes nothing.
        let again = engine.record_payment(&active.id).await.unwrap();
        assert_eq!(again.status, PolicyStatus::Active);
        assert_eq!(again.version, active.version);
    }

    #[tokio::test]
    async fn rejecting_purchase_records_alternatives() {
        let (engine, _) = engine_with(Arc::new(FixedScorer)).await;
        let booking = engine
            .create_booking(booking_request(Some("pol-42"), 24))
            .await
            .unwrap();

        let outcome = engine
            .decide_booking(decision(&booking, BookingAction::Reject))
            .await
            .unwrap();
        let record = outcome.user_policy.expect("rejected policy recorded");
        assert_eq!(record.status, PolicyStatus::Rejected);
        assert_eq!(
            record.workflow_status,
            PolicyWorkflowStatus::AlternativesSuggested
        );
        assert_eq!(record.alternative_policy_ids, vec![PolicyId::new("pol-basic")]);
    }

    #[tokio::test]
    async fn scorer_failure_degrades_gracefully() {
        let (engine, _) = engine_with(Arc::new(BrokenScorer)).await;
        let booking = engine.create_booking(booking_request(None, 24)).await.unwrap();

        let rejected = engine
            .decide_booking(decision(&booking, BookingAction::Reject))
            .await
            .unwrap()
            .booking;
        assert_eq!(rejected.status, BookingStatus::Rejected);
        assert!(rejected.risk_score.is_none());
        assert!(rejected.ai_analysis.is_none());
    }

    #[tokio::test]
    async fn scorer_timeout_degrades_gracefully() {
        let (engine, _) = engine_with(Arc::new(StalledScorer)).await;
        let booking = engine.create_booking(booking_request(None, 24)).await.unwrap();

        let rejected = engine
            .decide_booking(decision(&booking, BookingAction::Reject))
            .await
            .unwrap()
            .booking;
        assert_eq!(rejected.status, BookingStatus::Rejected);
        assert!(rejected.risk_score.is_none());
    }

    #[tokio::test]
    async fn concurrent_decisions_let_exactly_one_through() {
        let (engine, _) = engine_with(Arc::new(FixedScorer)).await;
        let booking = engine.create_booking(booking_request(None, 24)).await.unwrap();

        let approve = engine.decide_booking(decision(&booking, BookingAction::Approve));
        let reject = engine.decide_booking(decision(&booking, BookingAction::Reject));
        let (first, second) = tokio::join!(approve, reject);

        let successes = [first.is_ok(), second.is_ok()]
            .iter()
            .filter(|ok| **ok)
            .count();
        assert_eq!(successes, 1, "exactly one concurrent decision may win");
    }

    #[tokio::test]
    async fn concurrent_slot_creations_let_exactly_one_through() {
        let (engine, _) = engine_with(Arc::new(FixedScorer)).await;
        let request = booking_request(None, 24);
        let twin = request.clone();

        let (first, second) = tokio::join!(
            engine.create_booking(request),
            engine.create_booking(twin)
        );
        let successes = [first.is_ok(), second.is_ok()]
            .iter()
            .filter(|ok| **ok)
            .count();
        assert_eq!(successes, 1, "one slot, one booking");
    }

    #[tokio::test]
    async fn terminal_bookings_reject_further_transitions() {
        let (engine, _) = engine_with(Arc::new(FixedScorer)).await;
        let booking = engine.create_booking(booking_request(None, 24)).await.unwrap();
        let rejected = engine
            .decide_booking(decision(&booking, BookingAction::Reject))
            .await
            .unwrap()
            .booking;

        let err = engine
            .decide_booking(decision(&rejected, BookingAction::Approve))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::TerminalState { .. }));
    }

    #[tokio::test]
    async fn inactive_agent_cannot_take_bookings() {
        let (engine, _) = engine_with(Arc::new(FixedScorer)).await;
        engine
            .set_agent_active(&AgentId::new("agt-9"), false, Some("on leave"))
            .await
            .unwrap();

        let err = engine
            .create_booking(booking_request(None, 24))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::AgentNotEligible(_)));
    }

    #[tokio::test]
    async fn cancel_only_by_owner_and_only_future() {
        let (engine, _) = engine_with(Arc::new(FixedScorer)).await;
        let booking = engine.create_booking(booking_request(None, 24)).await.unwrap();

        let err = engine
            .cancel_booking(&booking.id, &UserId::new("usr-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Validation(_)));

        let cancelled = engine
            .cancel_booking(&booking.id, &UserId::new("usr-1"))
            .await
            .unwrap();
        assert_eq!(cancelled.status, BookingStatus::Cancelled);

        let err = engine
            .cancel_booking(&booking.id, &UserId::new("usr-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::TerminalState { .. }));
    }

    #[tokio::test]
    async fn renewal_window_is_enforced() {
        let (engine, store) = engine_with(Arc::new(FixedScorer)).await;
        let booking = engine
            .create_booking(booking_request(Some("pol-42"), 24))
            .await
            .unwrap();
        engine
            .decide_booking(decision(&booking, BookingAction::Approve))
            .await
            .unwrap();
        let booking = engine.get_booking(&booking.id).await.unwrap();
        let issued = engine
            .decide_booking(decision(&booking, BookingAction::Complete))
            .await
            .unwrap()
            .user_policy
            .unwrap();
        let active = engine.record_payment(&issued.id).await.unwrap();

        // A year out: too early.
        let err = engine.renew_policy(&active.id).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotRenewable(_)));

        // Pull the end date into the window, then renew.
        let mut near_expiry = store.get_user_policy(&active.id).await.unwrap();
        let old_end = Utc::now() + Duration::days(10);
        near_expiry.end_date = Some(old_end);
        let near_expiry = store.update_user_policy(near_expiry).await.unwrap();

        let renewed = engine.renew_policy(&near_expiry.id).await.unwrap();
        assert_eq!(renewed.renewed_count, 1);
        assert!(renewed.end_date.unwrap() > old_end);
    }

    #[tokio::test]
    async fn sweep_expires_each_booking_exactly_once() {
        let (engine, store) = engine_with(Arc::new(FixedScorer)).await;

        // Plant an approved booking whose slot ended ten minutes ago.
        let now = Utc::now();
        let mut stale = Booking::new(
            UserId::new("usr-1"),
            AgentId::new("agt-9"),
            BookingType::Enquiry,
            now - Duration::minutes(70),
            now - Duration::minutes(10),
            "missed consultation",
            now - Duration::minutes(60),
        );
        stale.mark_approved("https://meet/x".to_string(), None);
        store.insert_booking(stale.clone()).await.unwrap();

        let (first, second) =
            tokio::join!(engine.expire_due_bookings(now), engine.expire_due_bookings(now));
        let total = first.unwrap() + second.unwrap();
        assert_eq!(total, 1, "concurrent sweeps must expire a booking once");

        let expired = engine.get_booking(&stale.id).await.unwrap();
        assert_eq!(expired.status, BookingStatus::Expired);
    }

    #[tokio::test]
    async fn sweep_counts_sla_breach_for_unanswered_bookings() {
        let (engine, store) = engine_with(Arc::new(FixedScorer)).await;
        let now = Utc::now();
        let stale = Booking::new(
            UserId::new("usr-1"),
            AgentId::new("agt-9"),
            BookingType::Enquiry,
            now - Duration::hours(2),
            now - Duration::hours(1),
            "never answered",
            now - Duration::hours(3),
        );
        store.insert_booking(stale).await.unwrap();

        assert_eq!(engine.expire_due_bookings(now).await.unwrap(), 1);
        let agent = engine.get_agent(&AgentId::new("agt-9")).await.unwrap();
        assert_eq!(agent.sla_breaches, 1);
    }

    #[tokio::test]
    async fn escalating_a_rejection_copies_booking_links() {
        // Scenario: rejected booking disputed by the user.
        let (engine, _) = engine_with(Arc::new(FixedScorer)).await;
        let booking = engine
            .create_booking(booking_request(Some("pol-42"), 24))
            .await
            .unwrap();
        let rejected = engine
            .decide_booking(decision(&booking, BookingAction::Reject))
            .await
            .unwrap()
            .booking;

        let case = engine
            .escalate_rejection(&rejected.id, "my income was misread")
            .await
            .unwrap();
        assert_eq!(case.case_type, crate::types::CaseType::EscalatedRejection);
        assert_eq!(case.status, crate::types::CaseStatus::Pending);
        assert_eq!(case.user_id, rejected.user_id);
        assert_eq!(case.agent_id, rejected.agent_id);
        assert_eq!(case.policy_id, rejected.policy_id);
        assert_eq!(case.booking_id.as_ref(), Some(&rejected.id));

        let agent = engine.get_agent(&rejected.agent_id).await.unwrap();
        assert_eq!(agent.escalated_cases, 1);
    }

    #[tokio::test]
    async fn escalating_a_live_booking_is_rejected() {
        let (engine, _) = engine_with(Arc::new(FixedScorer)).await;
        let booking = engine.create_booking(booking_request(None, 24)).await.unwrap();
        let err = engine
            .escalate_rejection(&booking.id, "unhappy anyway")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Validation(_)));
    }

    #[tokio::test]
    async fn create_booking_validations() {
        let (engine, _) = engine_with(Arc::new(FixedScorer)).await;

        let mut no_reason = booking_request(None, 24);
        no_reason.reason = "   ".to_string();
        assert!(matches!(
            engine.create_booking(no_reason).await.unwrap_err(),
            BrokerError::Validation(_)
        ));

        let mut inverted = booking_request(None, 24);
        inverted.end_time = inverted.start_time - Duration::minutes(30);
        assert!(matches!(
            engine.create_booking(inverted).await.unwrap_err(),
            BrokerError::Validation(_)
        ));

        let past = booking_request(None, -4);
        assert!(matches!(
            engine.create_booking(past).await.unwrap_err(),
            BrokerError::Validation(_)
        ));

        let unknown_policy = booking_request(Some("pol-unregistered"), 24);
        assert!(matches!(
            engine.create_booking(unknown_policy).await.unwrap_err(),
            BrokerError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn wrong_agent_cannot_decide() {
        let (engine, _) = engine_with(Arc::new(FixedScorer)).await;
        let booking = engine.create_booking(booking_request(None, 24)).await.unwrap();

        let mut request = decision(&booking, BookingAction::Approve);
        request.agent_id = AgentId::new("agt-other");
        let err = engine.decide_booking(request).await.unwrap_err();
        assert!(matches!(err, BrokerError::Validation(_)));
    }
}
