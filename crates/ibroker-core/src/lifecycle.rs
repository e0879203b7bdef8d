//! Closed transition tables for the workflow records.
//!
//! Every legal edge is written out explicitly so no caller re-derives
//! status rules from strings. Anything not in the table is rejected with
//! a terminal-state error before any state is touched.

use crate::error::BrokerError;
use crate::types::{BookingAction, BookingStatus, CaseStatus, PolicyStatus};

/// Resolve the successor state for an agent action on a booking.
///
/// ```text
/// PENDING  --approve--> APPROVED
/// PENDING  --reject---> REJECTED
/// APPROVED --complete-> COMPLETED
/// APPROVED --reject---> REJECTED
/// APPROVED --expire---> EXPIRED
/// PENDING  --expire---> EXPIRED      (sweep only: never responded)
/// ```
pub fn booking_transition(
    booking_id: &str,
    current: BookingStatus,
    action: BookingAction,
) -> Result<BookingStatus, BrokerError> {
    use BookingAction::*;
    use BookingStatus::*;

    let next = match (current, action) {
        (Pending, Approve) => Approved,
        (Pending, Reject) => Rejected,
        (Pending, Expire) => Expired,
        (Approved, Complete) => Completed,
        (Approved, Reject) => Rejected,
        (Approved, Expire) => Expired,
        _ => {
            return Err(BrokerError::terminal(
                format!("booking {booking_id}"),
                current.name(),
            ))
        }
    };
    Ok(next)
}

/// A user may withdraw a booking only while it is still live.
pub fn booking_cancellation(
    booking_id: &str,
    current: BookingStatus,
) -> Result<BookingStatus, BrokerError> {
    match current {
        BookingStatus::Pending | BookingStatus::Approved => Ok(BookingStatus::Cancelled),
        _ => Err(BrokerError::terminal(
            format!("booking {booking_id}"),
            current.name(),
        )),
    }
}

/// Payment activates a quoted or payment-pending policy.
///
/// Returns `None` when the policy is already active: activation is
/// idempotent, repeated payment events are absorbed without error.
pub fn policy_activation(
    policy_id: &str,
    current: PolicyStatus,
) -> Result<Option<PolicyStatus>, BrokerError> {
    match current {
        PolicyStatus::Quoted | PolicyStatus::PaymentPending => Ok(Some(PolicyStatus::Active)),
        PolicyStatus::Active => Ok(None),
        PolicyStatus::Rejected => Err(BrokerError::terminal(
            format!("user policy {policy_id}"),
            current.name(),
        )),
    }
}

/// Exception cases move strictly forward: review may be skipped by a
/// direct resolve, but a resolved case only archives.
pub fn case_transition(
    case_id: &str,
    current: CaseStatus,
    next: CaseStatus,
) -> Result<CaseStatus, BrokerError> {
    use CaseStatus::*;

    let allowed = matches!(
        (current, next),
        (Pending, UnderReview) | (Pending, Resolved) | (UnderReview, Resolved) | (Resolved, Closed)
    );
    if allowed {
        Ok(next)
    } else {
        Err(BrokerError::terminal(
            format!("case {case_id}"),
            current.name(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booking_edges_match_table() {
        use BookingAction::*;
        use BookingStatus::*;

        assert_eq!(booking_transition("b", Pending, Approve).unwrap(), Approved);
        assert_eq!(booking_transition("b", Pending, Reject).unwrap(), Rejected);
        assert_eq!(
            booking_transition("b", Approved, Complete).unwrap(),
            Completed
        );
        assert_eq!(booking_transition("b", Approved, Reject).unwrap(), Rejected);
        assert_eq!(booking_transition("b", Approved, Expire).unwrap(), Expired);
        assert_eq!(booking_transition("b", Pending, Expire).unwrap(), Expired);
    }

    #[test]
    fn booking_rejects_edges_outside_table() {
        use BookingAction::*;
        use BookingStatus::*;

        for (from, action) in [
            (Pending, Complete),
            (Completed, Approve),
            (Rejected, Complete),
            (Expired, Approve),
            (Cancelled, Reject),
            (Approved, Approve),
        ] {
            let err = booking_transition("b-1", from, action).unwrap_err();
            assert!(
                matches!(err, BrokerError::TerminalState { .. }),
                "{from:?} --{action:?}--> should be terminal"
            );
        }
    }

    #[test]
    fn cancellation_only_pre_terminal() {
        assert!(booking_cancellation("b", BookingStatus::Pending).is_ok());
        assert!(booking_cancellation("b", BookingStatus::Approved).is_ok());
        for status in [
            BookingStatus::Completed,
            BookingStatus::Rejected,
            BookingStatus::Expired,
            BookingStatus::Cancelled,
        ] {
            assert!(booking_cancellation("b", status).is_err());
        }
    }

    #[test]
    fn activation_is_idempotent_once_active() {
        assert_eq!(
            policy_activation("p", PolicyStatus::PaymentPending).unwrap(),
            Some(PolicyStatus::Active)
        );
        assert_eq!(
            policy_activation("p", PolicyStatus::Quoted).unwrap(),
            Some(PolicyStatus::Active)
        );
        assert_eq!(policy_activation("p", PolicyStatus::Active).unwrap(), None);
        assert!(policy_activation("p", PolicyStatus::Rejected).is_err());
    }

    #[test]
    fn case_moves_strictly_forward() {
        use CaseStatus::*;
        assert!(case_transition("c", Pending, UnderReview).is_ok());
        assert!(case_transition("c", Pending, Resolved).is_ok());
        assert!(case_transition("c", UnderReview, Resolved).is_ok());
        assert!(case_transition("c", Resolved, Closed).is_ok());

        assert!(case_transition("c", Resolved, Pending).is_err());
        assert!(case_transition("c", Closed, Resolved).is_err());
        assert!(case_transition("c", UnderReview, Pending).is_err());
        assert!(case_transition("c", Pending, Closed).is_err());
    }
}
