//! iBroker core: the policy-issuance workflow engine.
//!
//! This crate owns the booking, user-policy, and exception-case state
//! machines, validates every transition against an explicit table,
//! linearizes per-record mutations through an optimistic-version store,
//! and treats the risk scorer as a purely advisory collaborator.

#![deny(unsafe_code)]

pub mod audit;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod events;
pub mod governance;
pub mod lifecycle;
pub mod scorer;
pub mod store;
pub mod types;

pub use audit::{AuditEntry, AuditTrail, SharedAudit};
pub use engine::{
    CreateBookingRequest, DecisionOutcome, DecisionRequest, WorkflowConfig, WorkflowEngine,
};
pub use error::BrokerError;
pub use escalation::{ExceptionDesk, OpenCaseRequest};
pub use events::{DomainEvent, EventSink, NullSink};
pub use governance::AgentGovernance;
pub use scorer::{Eligibility, RiskAssessment, RiskLevel, RiskScorer};
pub use store::{
    bootstrap_store, BookingFilter, MemoryStore, PostgresStore, RecordStore, SharedStore,
    StoreConfig,
};
pub use types::{
    ActionTaken, AgentId, AgentProfile, Booking, BookingAction, BookingId, BookingStatus,
    BookingType, CaseId, CasePriority, CaseStatus, CaseType, ExceptionCase, PolicyId,
    PolicyStatus, PolicySummary, PolicyWorkflowStatus, UserId, UserPolicy, UserPolicyId,
    UserProfile,
};
