#![deny(unsafe_code)]

pub mod sweep;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use ibroker_adapters::{AdvisoryScorer, AdvisoryScorerConfig, BufferedNotificationSink, Notification};
use ibroker_core::{
    ActionTaken, AgentId, AgentProfile, AuditEntry, Booking, BookingFilter, BookingId,
    BrokerError, CaseId, CasePriority, CaseType, CreateBookingRequest, DecisionRequest,
    ExceptionCase, OpenCaseRequest, PolicyId, PolicySummary, StoreConfig, UserId, UserPolicy,
    UserPolicyId, UserProfile, WorkflowConfig, WorkflowEngine,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub store: StoreConfig,
    pub workflow: WorkflowConfig,
    /// Catalog policies registered at startup and offered as alternative
    /// suggestions by the advisory scorer.
    pub seed_catalog: Vec<PolicySummary>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::Memory,
            workflow: WorkflowConfig::default(),
            seed_catalog: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<WorkflowEngine>,
    pub notifications: Arc<BufferedNotificationSink>,
    store_backend: &'static str,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let ServiceConfig {
            store,
            workflow,
            seed_catalog,
        } = config;

        let store_backend = store.label();
        let notifications = Arc::new(BufferedNotificationSink::new());
        let scorer = Arc::new(
            AdvisoryScorer::new(AdvisoryScorerConfig::default())
                .with_alternatives(seed_catalog.clone()),
        );
        let engine = Arc::new(
            WorkflowEngine::bootstrap(workflow, store, scorer, notifications.clone()).await?,
        );
        for summary in seed_catalog {
            engine.register_policy(summary).await;
        }

        Ok(Self {
            engine,
            notifications,
            store_backend,
        })
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core engine error: {0}")]
    Core(#[from] BrokerError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] BrokerError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

/// One stable error kind per response so the frontend can branch without
/// parsing message text.
fn error_kind(err: &BrokerError) -> (&'static str, StatusCode) {
    match err {
        BrokerError::Validation(_) => ("validation", StatusCode::BAD_REQUEST),
        BrokerError::NotFound(_) => ("not_found", StatusCode::NOT_FOUND),
        BrokerError::Conflict(_) => ("conflict", StatusCode::CONFLICT),
        BrokerError::TerminalState { .. } => ("terminal_state", StatusCode::CONFLICT),
        BrokerError::AgentNotEligible(_) => ("agent_not_eligible", StatusCode::FORBIDDEN),
        BrokerError::NotRenewable(_) => ("not_renewable", StatusCode::UNPROCESSABLE_ENTITY),
        BrokerError::Unavailable(_) => ("unavailable", StatusCode::SERVICE_UNAVAILABLE),
        BrokerError::Serialization(_) | BrokerError::Store(_) => {
            ("internal", StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => (
                status,
                Json(serde_json::json!({ "error": message, "kind": "validation" })),
            )
                .into_response(),
            ApiError::Core(err) => {
                let (kind, status) = error_kind(&err);
                (
                    status,
                    Json(serde_json::json!({ "error": err.to_string(), "kind": kind })),
                )
                    .into_response()
            }
        }
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/bookings", post(create_booking).get(list_bookings))
        .route("/v1/bookings/:id", get(get_booking))
        .route("/v1/bookings/:id/cancel", post(cancel_booking))
        .route("/v1/workflow/agent/decision", post(agent_decision))
        .route("/v1/workflow/:booking_id/insights", get(booking_insights))
        .route(
            "/v1/workflow/activate-policy/:user_policy_id",
            post(activate_policy),
        )
        .route(
            "/v1/workflow/renew-policy/:user_policy_id",
            post(renew_policy),
        )
        .route("/v1/policies", get(list_policies))
        .route("/v1/policies/:id", get(get_policy))
        .route("/v1/exceptions/escalate", post(escalate))
        .route("/v1/admin/exceptions", post(open_case).get(list_cases))
        .route("/v1/admin/exceptions/:case_id", get(get_case))
        .route("/v1/admin/exceptions/:case_id/review", put(review_case))
        .route("/v1/admin/exceptions/:case_id/resolve", put(resolve_case))
        .route("/v1/admin/agents", post(register_agent).get(list_agents))
        .route("/v1/admin/agents/:agent_id", get(get_agent))
        .route("/v1/admin/agents/:agent_id/status", put(agent_status))
        .route(
            "/v1/admin/agents/:agent_id/assignments",
            put(agent_assignments),
        )
        .route("/v1/admin/catalog", post(register_policy).get(list_catalog))
        .route("/v1/admin/users", post(register_user))
        .route("/v1/notifications", get(notifications))
        .route("/v1/audit/entries", get(audit_entries))
        .with_state(state)
}

// ── Health ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    store_backend: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "ibroker-service",
        store_backend: state.store_backend,
    })
}

// ── Bookings ─────────────────────────────────────────────────────────

async fn create_booking(
    State(state): State<ServiceState>,
    Json(request): Json<CreateBookingRequest>,
) -> Result<Json<Booking>, ApiError> {
    Ok(Json(state.engine.create_booking(request).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct BookingsQuery {
    user_id: Option<String>,
    agent_id: Option<String>,
}

async fn list_bookings(
    State(state): State<ServiceState>,
    Query(query): Query<BookingsQuery>,
) -> Result<Json<Vec<Booking>>, ApiError> {
    let filter = BookingFilter {
        user_id: query.user_id.map(UserId::new),
        agent_id: query.agent_id.map(AgentId::new),
    };
    Ok(Json(state.engine.list_bookings(filter).await?))
}

async fn get_booking(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<Booking>, ApiError> {
    Ok(Json(state.engine.get_booking(&BookingId::new(id)).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct CancelPayload {
    user_id: UserId,
}

async fn cancel_booking(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    Json(payload): Json<CancelPayload>,
) -> Result<Json<Booking>, ApiError> {
    Ok(Json(
        state
            .engine
            .cancel_booking(&BookingId::new(id), &payload.user_id)
            .await?,
    ))
}

// ── Agent workflow ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
struct DecisionResponse {
    message: String,
    booking: Booking,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_policy: Option<UserPolicy>,
}

async fn agent_decision(
    State(state): State<ServiceState>,
    Json(request): Json<DecisionRequest>,
) -> Result<Json<DecisionResponse>, ApiError> {
    let outcome = state.engine.decide_booking(request).await?;
    Ok(Json(DecisionResponse {
        message: format!(
            "booking {} is now {}",
            outcome.booking.id,
            outcome.booking.status.name()
        ),
        booking: outcome.booking,
        user_policy: outcome.user_policy,
    }))
}

#[derive(Debug, Clone, Serialize)]
struct InsightsResponse {
    booking_id: String,
    risk_score: f64,
    match_score: u8,
    eligibility: ibroker_core::Eligibility,
    risk_level: ibroker_core::RiskLevel,
    risk_reason: String,
    alternative_policies: Vec<PolicySummary>,
}

async fn booking_insights(
    State(state): State<ServiceState>,
    Path(booking_id): Path<String>,
) -> Result<Json<InsightsResponse>, ApiError> {
    let booking_id = BookingId::new(booking_id);
    let assessment = state.engine.booking_insights(&booking_id).await?;
    Ok(Json(InsightsResponse {
        booking_id: booking_id.to_string(),
        risk_score: assessment.risk_fraction(),
        match_score: assessment.match_score,
        eligibility: assessment.eligibility,
        risk_level: assessment.risk_level,
        risk_reason: assessment.risk_reason.clone(),
        alternative_policies: assessment.alternatives,
    }))
}

async fn activate_policy(
    State(state): State<ServiceState>,
    Path(user_policy_id): Path<String>,
) -> Result<Json<UserPolicy>, ApiError> {
    Ok(Json(
        state
            .engine
            .record_payment(&UserPolicyId::new(user_policy_id))
            .await?,
    ))
}

async fn renew_policy(
    State(state): State<ServiceState>,
    Path(user_policy_id): Path<String>,
) -> Result<Json<UserPolicy>, ApiError> {
    Ok(Json(
        state
            .engine
            .renew_policy(&UserPolicyId::new(user_policy_id))
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct PoliciesQuery {
    user_id: Option<String>,
}

async fn list_policies(
    State(state): State<ServiceState>,
    Query(query): Query<PoliciesQuery>,
) -> Result<Json<Vec<UserPolicy>>, ApiError> {
    let user_id = query.user_id.map(UserId::new);
    Ok(Json(state.engine.list_user_policies(user_id.as_ref()).await?))
}

async fn get_policy(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<UserPolicy>, ApiError> {
    Ok(Json(
        state.engine.get_user_policy(&UserPolicyId::new(id)).await?,
    ))
}

// ── Exceptions ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct EscalatePayload {
    booking_id: Option<BookingId>,
    user_policy_id: Option<UserPolicyId>,
    complaint: String,
}

async fn escalate(
    State(state): State<ServiceState>,
    Json(payload): Json<EscalatePayload>,
) -> Result<Json<ExceptionCase>, ApiError> {
    let case = match (payload.booking_id, payload.user_policy_id) {
        (Some(booking_id), _) => {
            state
                .engine
                .escalate_rejection(&booking_id, payload.complaint)
                .await?
        }
        (None, Some(user_policy_id)) => {
            state
                .engine
                .escalate_policy_rejection(&user_policy_id, payload.complaint)
                .await?
        }
        (None, None) => {
            return Err(ApiError::bad_request(
                "either booking_id or user_policy_id is required",
            ))
        }
    };
    Ok(Json(case))
}

#[derive(Debug, Clone, Deserialize)]
struct OpenCasePayload {
    case_type: CaseType,
    priority: CasePriority,
    user_id: UserId,
    agent_id: AgentId,
    policy_id: Option<PolicyId>,
    booking_id: Option<BookingId>,
    description: String,
    complaint: Option<String>,
}

async fn open_case(
    State(state): State<ServiceState>,
    Json(payload): Json<OpenCasePayload>,
) -> Result<Json<ExceptionCase>, ApiError> {
    Ok(Json(
        state
            .engine
            .open_case(OpenCaseRequest {
                case_type: payload.case_type,
                priority: payload.priority,
                user_id: payload.user_id,
                agent_id: payload.agent_id,
                policy_id: payload.policy_id,
                booking_id: payload.booking_id,
                description: payload.description,
                complaint: payload.complaint,
            })
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct CasesQuery {
    #[serde(default)]
    open: bool,
}

async fn list_cases(
    State(state): State<ServiceState>,
    Query(query): Query<CasesQuery>,
) -> Result<Json<Vec<ExceptionCase>>, ApiError> {
    Ok(Json(state.engine.list_cases(query.open).await?))
}

async fn get_case(
    State(state): State<ServiceState>,
    Path(case_id): Path<String>,
) -> Result<Json<ExceptionCase>, ApiError> {
    Ok(Json(state.engine.get_case(&CaseId::new(case_id)).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct ReviewPayload {
    reviewer: String,
}

async fn review_case(
    State(state): State<ServiceState>,
    Path(case_id): Path<String>,
    Json(payload): Json<ReviewPayload>,
) -> Result<Json<ExceptionCase>, ApiError> {
    Ok(Json(
        state
            .engine
            .begin_case_review(&CaseId::new(case_id), &payload.reviewer)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct ResolvePayload {
    resolution: String,
    action_taken: ActionTaken,
    resolved_by: String,
}

async fn resolve_case(
    State(state): State<ServiceState>,
    Path(case_id): Path<String>,
    Json(payload): Json<ResolvePayload>,
) -> Result<Json<ExceptionCase>, ApiError> {
    Ok(Json(
        state
            .engine
            .resolve_case(
                &CaseId::new(case_id),
                payload.resolution,
                payload.action_taken,
                &payload.resolved_by,
            )
            .await?,
    ))
}

// ── Agent administration ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct RegisterAgentPayload {
    agent_id: AgentId,
    display_name: String,
    #[serde(default)]
    regions: BTreeSet<String>,
    #[serde(default)]
    policy_types: BTreeSet<String>,
}

async fn register_agent(
    State(state): State<ServiceState>,
    Json(payload): Json<RegisterAgentPayload>,
) -> Result<Json<AgentProfile>, ApiError> {
    let mut profile = AgentProfile::new(payload.agent_id, payload.display_name);
    profile.assigned_regions = payload.regions;
    profile.assigned_policy_types = payload.policy_types;
    Ok(Json(state.engine.register_agent(profile).await?))
}

async fn list_agents(
    State(state): State<ServiceState>,
) -> Result<Json<Vec<AgentProfile>>, ApiError> {
    Ok(Json(state.engine.list_agents().await?))
}

async fn get_agent(
    State(state): State<ServiceState>,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentProfile>, ApiError> {
    Ok(Json(state.engine.get_agent(&AgentId::new(agent_id)).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct AgentStatusPayload {
    is_active: bool,
    reason: Option<String>,
}

async fn agent_status(
    State(state): State<ServiceState>,
    Path(agent_id): Path<String>,
    Json(payload): Json<AgentStatusPayload>,
) -> Result<Json<AgentProfile>, ApiError> {
    Ok(Json(
        state
            .engine
            .set_agent_active(
                &AgentId::new(agent_id),
                payload.is_active,
                payload.reason.as_deref(),
            )
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct AssignmentsPayload {
    #[serde(default)]
    regions: BTreeSet<String>,
    #[serde(default)]
    policy_types: BTreeSet<String>,
}

async fn agent_assignments(
    State(state): State<ServiceState>,
    Path(agent_id): Path<String>,
    Json(payload): Json<AssignmentsPayload>,
) -> Result<Json<AgentProfile>, ApiError> {
    Ok(Json(
        state
            .engine
            .set_agent_assignments(
                &AgentId::new(agent_id),
                payload.regions,
                payload.policy_types,
            )
            .await?,
    ))
}

// ── Registries ───────────────────────────────────────────────────────

async fn register_policy(
    State(state): State<ServiceState>,
    Json(summary): Json<PolicySummary>,
) -> Result<Json<PolicySummary>, ApiError> {
    state.engine.register_policy(summary.clone()).await;
    Ok(Json(summary))
}

async fn list_catalog(State(state): State<ServiceState>) -> Json<Vec<PolicySummary>> {
    Json(state.engine.list_catalog().await)
}

async fn register_user(
    State(state): State<ServiceState>,
    Json(profile): Json<UserProfile>,
) -> Result<Json<UserProfile>, ApiError> {
    state.engine.register_user_profile(profile.clone()).await;
    Ok(Json(profile))
}

// ── Notifications & audit ────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct NotificationsQuery {
    user_id: String,
    #[serde(default)]
    mark_read: bool,
}

#[derive(Debug, Clone, Serialize)]
struct NotificationsResponse {
    unread: usize,
    items: Vec<Notification>,
}

async fn notifications(
    State(state): State<ServiceState>,
    Query(query): Query<NotificationsQuery>,
) -> Result<Json<NotificationsResponse>, ApiError> {
    if query.user_id.trim().is_empty() {
        return Err(ApiError::bad_request("user_id is required"));
    }
    let user_id = UserId::new(query.user_id);
    let unread = state.notifications.unread_count(&user_id);
    let items = state.notifications.for_user(&user_id);
    if query.mark_read {
        state.notifications.mark_read(&user_id);
    }
    Ok(Json(NotificationsResponse { unread, items }))
}

#[derive(Debug, Clone, Serialize)]
struct AuditResponse {
    verified: bool,
    total: usize,
    items: Vec<AuditEntry>,
}

async fn audit_entries(State(state): State<ServiceState>) -> Json<AuditResponse> {
    let items = state.engine.audit_entries().await;
    Json(AuditResponse {
        verified: state.engine.verify_audit_chain().await,
        total: items.len(),
        items,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::{Duration, Utc};
    use tower::ServiceExt;

    fn catalog_policy(id: &str, premium: u64) -> serde_json::Value {
        serde_json::json!({
            "policy_id": id,
            "name": "Family Health Plus",
            "policy_type": "health",
            "annual_premium_minor": premium,
            "coverage_minor": 50_000_000u64,
            "min_age": 18,
            "max_age": 65,
            "tenure_months": 12,
        })
    }

    async fn request_json(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(builder.body(body).expect("request built"))
            .await
            .expect("request sent");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn test_app() -> Router {
        let state = ServiceState::bootstrap(ServiceConfig::default()).await.unwrap();
        let app = build_router(state);

        let (status, _) = request_json(
            &app,
            "POST",
            "/v1/admin/agents",
            Some(serde_json::json!({ "agent_id": "agt-9", "display_name": "Sam" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = request_json(
            &app,
            "POST",
            "/v1/admin/catalog",
            Some(catalog_policy("pol-42", 120_000)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = request_json(
            &app,
            "POST",
            "/v1/admin/users",
            Some(serde_json::json!({
                "user_id": "usr-1",
                "full_name": "Jo Doe",
                "age": 34,
                "annual_income_minor": 600_000u64,
                "region": "north",
                "dependents": 1,
                "smoker": false,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        app
    }

    fn booking_payload(policy: Option<&str>) -> serde_json::Value {
        let now = Utc::now();
        serde_json::json!({
            "user_id": "usr-1",
            "agent_id": "agt-9",
            "booking_type": if policy.is_some() { "purchase" } else { "enquiry" },
            "start_time": now + Duration::hours(24),
            "end_time": now + Duration::hours(25),
            "reason": "coverage consultation",
            "policy_id": policy,
        })
    }

    fn decision_payload(booking_id: &str, action: &str) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "booking_id": booking_id,
            "agent_id": "agt-9",
            "action": action,
        });
        if action == "reject" {
            payload["rejection_reason"] = serde_json::json!("income mismatch");
        }
        payload
    }

    #[tokio::test]
    async fn purchase_flow_over_http() {
        let app = test_app().await;

        let (status, booking) =
            request_json(&app, "POST", "/v1/bookings", Some(booking_payload(Some("pol-42")))).await;
        assert_eq!(status, StatusCode::OK);
        let booking_id = booking["id"].as_str().unwrap().to_string();
        assert_eq!(booking["status"], "pending");

        let (status, _) = request_json(
            &app,
            "POST",
            "/v1/workflow/agent/decision",
            Some(decision_payload(&booking_id, "approve")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, decision) = request_json(
            &app,
            "POST",
            "/v1/workflow/agent/decision",
            Some(decision_payload(&booking_id, "complete")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decision["booking"]["status"], "completed");
        let user_policy_id = decision["user_policy"]["id"].as_str().unwrap().to_string();
        assert_eq!(decision["user_policy"]["status"], "payment_pending");
        assert_eq!(decision["user_policy"]["workflow_status"], "approved");

        let uri = format!("/v1/workflow/activate-policy/{user_policy_id}");
        let (status, active) = request_json(&app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(active["status"], "active");
        assert!(active["end_date"].is_string());

        // Idempotent activation.
        let (status, again) = request_json(&app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again["version"], active["version"]);
    }

    #[tokio::test]
    async fn rejection_exposes_insights_and_escalation() {
        let app = test_app().await;

        let (_, booking) =
            request_json(&app, "POST", "/v1/bookings", Some(booking_payload(Some("pol-42")))).await;
        let booking_id = booking["id"].as_str().unwrap().to_string();

        let (status, decision) = request_json(
            &app,
            "POST",
            "/v1/workflow/agent/decision",
            Some(decision_payload(&booking_id, "reject")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decision["booking"]["status"], "rejected");
        assert!(decision["booking"]["risk_score"].is_number());

        let (status, insights) = request_json(
            &app,
            "GET",
            &format!("/v1/workflow/{booking_id}/insights"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(insights["risk_score"].is_number());
        assert!(insights["risk_reason"].is_string());

        let (status, case) = request_json(
            &app,
            "POST",
            "/v1/exceptions/escalate",
            Some(serde_json::json!({
                "booking_id": booking_id,
                "complaint": "my income was misread",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(case["case_type"], "escalated_rejection");
        assert_eq!(case["status"], "pending");
        let case_id = case["case_id"].as_str().unwrap().to_string();

        let (status, resolved) = request_json(
            &app,
            "PUT",
            &format!("/v1/admin/exceptions/{case_id}/resolve"),
            Some(serde_json::json!({
                "resolution": "agent decision upheld after review",
                "action_taken": "rejected",
                "resolved_by": "admin-1",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resolved["status"], "resolved");

        // Resolution is write-once.
        let (status, _) = request_json(
            &app,
            "PUT",
            &format!("/v1/admin/exceptions/{case_id}/resolve"),
            Some(serde_json::json!({
                "resolution": "second thoughts",
                "action_taken": "approved",
                "resolved_by": "admin-2",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn suspension_deactivates_agent_over_http() {
        let app = test_app().await;

        let (_, case) = request_json(
            &app,
            "POST",
            "/v1/admin/exceptions",
            Some(serde_json::json!({
                "case_type": "agent_misconduct",
                "priority": "critical",
                "user_id": "usr-1",
                "agent_id": "agt-9",
                "description": "pressured user into costlier cover",
            })),
        )
        .await;
        let case_id = case["case_id"].as_str().unwrap().to_string();

        let (status, _) = request_json(
            &app,
            "PUT",
            &format!("/v1/admin/exceptions/{case_id}/resolve"),
            Some(serde_json::json!({
                "resolution": "complaints upheld",
                "action_taken": "agent_suspended",
                "resolved_by": "admin-1",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, agent) = request_json(&app, "GET", "/v1/admin/agents/agt-9", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(agent["is_active"], false);
        assert!(agent["deactivation_reason"]
            .as_str()
            .unwrap()
            .contains(&case_id));
    }

    #[tokio::test]
    async fn error_kinds_map_to_status_codes() {
        let app = test_app().await;

        // Missing reason → validation → 400.
        let mut invalid = booking_payload(None);
        invalid["reason"] = serde_json::json!("   ");
        let (status, body) = request_json(&app, "POST", "/v1/bookings", Some(invalid)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");

        // Unknown booking → 404.
        let (status, body) = request_json(&app, "GET", "/v1/bookings/bkg-missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");

        // Slot double-booking → conflict → 409.
        let payload = booking_payload(None);
        let (status, _) = request_json(&app, "POST", "/v1/bookings", Some(payload.clone())).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = request_json(&app, "POST", "/v1/bookings", Some(payload)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "conflict");

        // Inactive agent → 403.
        let (status, _) = request_json(
            &app,
            "PUT",
            "/v1/admin/agents/agt-9/status",
            Some(serde_json::json!({ "is_active": false, "reason": "on leave" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let mut late = booking_payload(None);
        late["start_time"] = serde_json::json!(Utc::now() + Duration::hours(48));
        late["end_time"] = serde_json::json!(Utc::now() + Duration::hours(49));
        let (status, body) = request_json(&app, "POST", "/v1/bookings", Some(late)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["kind"], "agent_not_eligible");
    }

    #[tokio::test]
    async fn renewal_outside_window_is_unprocessable() {
        let app = test_app().await;

        let (_, booking) =
            request_json(&app, "POST", "/v1/bookings", Some(booking_payload(Some("pol-42")))).await;
        let booking_id = booking["id"].as_str().unwrap().to_string();
        request_json(
            &app,
            "POST",
            "/v1/workflow/agent/decision",
            Some(decision_payload(&booking_id, "approve")),
        )
        .await;
        let (_, decision) = request_json(
            &app,
            "POST",
            "/v1/workflow/agent/decision",
            Some(decision_payload(&booking_id, "complete")),
        )
        .await;
        let user_policy_id = decision["user_policy"]["id"].as_str().unwrap().to_string();
        request_json(
            &app,
            "POST",
            &format!("/v1/workflow/activate-policy/{user_policy_id}"),
            None,
        )
        .await;

        let (status, body) = request_json(
            &app,
            "POST",
            &format!("/v1/workflow/renew-policy/{user_policy_id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["kind"], "not_renewable");
    }

    #[tokio::test]
    async fn notifications_and_audit_track_the_flow() {
        let app = test_app().await;

        let (_, booking) =
            request_json(&app, "POST", "/v1/bookings", Some(booking_payload(None))).await;
        let booking_id = booking["id"].as_str().unwrap().to_string();
        request_json(
            &app,
            "POST",
            "/v1/workflow/agent/decision",
            Some(decision_payload(&booking_id, "approve")),
        )
        .await;

        let (status, body) =
            request_json(&app, "GET", "/v1/notifications?user_id=usr-1&mark_read=true", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["unread"], 2);
        assert_eq!(body["items"].as_array().unwrap().len(), 2);

        let (_, body) = request_json(&app, "GET", "/v1/notifications?user_id=usr-1", None).await;
        assert_eq!(body["unread"], 0);

        let (status, audit) = request_json(&app, "GET", "/v1/audit/entries", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(audit["verified"], true);
        assert!(audit["total"].as_u64().unwrap() >= 2);
    }
}
