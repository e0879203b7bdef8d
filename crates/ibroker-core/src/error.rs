use thiserror::Error;

/// Workflow engine errors surfaced to API callers.
///
/// Every mutating operation returns either the updated record or one of
/// these kinds; the transport layer maps them to status codes without
/// inspecting message text.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Malformed or missing required input. Rejected before any state change.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Version or slot race. The caller must re-read and retry.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Attempted transition not permitted from the record's current state.
    #[error("'{record}' does not permit this transition from state '{status}'")]
    TerminalState { record: String, status: String },

    /// Agent governance gate failed. Not retryable without reassignment.
    #[error("agent not eligible: {0}")]
    AgentNotEligible(String),

    /// Renewal requested outside the renewal window.
    #[error("policy not renewable: {0}")]
    NotRenewable(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Store or collaborator timeout. Retryable with backoff.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store error: {0}")]
    Store(String),
}

impl BrokerError {
    pub fn terminal(record: impl Into<String>, status: impl Into<String>) -> Self {
        Self::TerminalState {
            record: record.into(),
            status: status.into(),
        }
    }
}
