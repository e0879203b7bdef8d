//! Domain events published by the workflow engine.
//!
//! Delivery is a subscriber concern. The engine publishes after a
//! transition has committed and never waits on delivery outcomes, so a
//! slow or broken sink cannot influence the state machine.

use crate::types::{AgentProfile, Booking, BookingAction, ExceptionCase, UserId, UserPolicy};
use async_trait::async_trait;

#[derive(Clone, Debug)]
pub enum DomainEvent {
    BookingCreated { booking: Booking },
    BookingDecided { booking: Booking, action: BookingAction },
    BookingCancelled { booking: Booking },
    BookingExpired { booking: Booking },
    PolicyIssued { policy: UserPolicy },
    PolicyActivated { policy: UserPolicy },
    PolicyRenewed { policy: UserPolicy },
    CaseOpened { case: ExceptionCase },
    CaseResolved { case: ExceptionCase },
    AgentStatusChanged { agent: AgentProfile },
}

impl DomainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BookingCreated { .. } => "booking_created",
            Self::BookingDecided { .. } => "booking_decided",
            Self::BookingCancelled { .. } => "booking_cancelled",
            Self::BookingExpired { .. } => "booking_expired",
            Self::PolicyIssued { .. } => "policy_issued",
            Self::PolicyActivated { .. } => "policy_activated",
            Self::PolicyRenewed { .. } => "policy_renewed",
            Self::CaseOpened { .. } => "case_opened",
            Self::CaseResolved { .. } => "case_resolved",
            Self::AgentStatusChanged { .. } => "agent_status_changed",
        }
    }

    /// The user a notification about this event should reach, if any.
    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            Self::BookingCreated { booking }
            | Self::BookingDecided { booking, .. }
            | Self::BookingCancelled { booking }
            | Self::BookingExpired { booking } => Some(&booking.user_id),
            Self::PolicyIssued { policy }
            | Self::PolicyActivated { policy }
            | Self::PolicyRenewed { policy } => Some(&policy.user_id),
            Self::CaseOpened { case } | Self::CaseResolved { case } => Some(&case.user_id),
            Self::AgentStatusChanged { .. } => None,
        }
    }
}

/// Receives committed domain events for fan-out (polling buffers,
/// websockets, webhooks).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: DomainEvent);
}

/// Sink that drops everything. Useful for tests and batch tools.
#[derive(Debug, Clone, Default)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn publish(&self, _event: DomainEvent) {}
}
