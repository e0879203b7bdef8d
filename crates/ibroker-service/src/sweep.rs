//! Background expiry sweep.
//!
//! Periodically retires live bookings whose slot has passed. The sweep is
//! idempotent and races user-initiated decisions safely: the engine
//! absorbs lost optimistic-version races, so running two sweeps at once
//! expires each booking exactly once.

use chrono::Utc;
use ibroker_core::WorkflowEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub fn spawn_expiry_sweep(engine: Arc<WorkflowEngine>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so a service restart
        // does not double-run the sweep during startup.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match engine.expire_due_bookings(Utc::now()).await {
                Ok(0) => {}
                Ok(expired) => info!(expired, "expiry sweep retired overdue bookings"),
                Err(err) => warn!(error = %err, "expiry sweep pass failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use ibroker_core::{
        AgentId, AgentProfile, Booking, BookingType, MemoryStore, NullSink, SharedStore, UserId,
        WorkflowConfig,
    };
    use ibroker_core::scorer::{RiskAssessment, RiskScorer};
    use ibroker_core::types::{PolicySummary, UserProfile};
    use ibroker_core::BrokerError;

    struct NoScorer;

    #[async_trait::async_trait]
    impl RiskScorer for NoScorer {
        async fn score(
            &self,
            _profile: &UserProfile,
            _policy: Option<&PolicySummary>,
        ) -> Result<RiskAssessment, BrokerError> {
            Err(BrokerError::Unavailable("not wired".to_string()))
        }
    }

    #[tokio::test]
    async fn sweep_task_expires_overdue_bookings() {
        let store: SharedStore = std::sync::Arc::new(MemoryStore::new());
        let engine = Arc::new(WorkflowEngine::new(
            store.clone(),
            Arc::new(NoScorer),
            Arc::new(NullSink),
            WorkflowConfig::default(),
        ));
        engine
            .register_agent(AgentProfile::new(AgentId::new("agt-1"), "Sam"))
            .await
            .unwrap();

        let now = Utc::now();
        let stale = Booking::new(
            UserId::new("usr-1"),
            AgentId::new("agt-1"),
            BookingType::Enquiry,
            now - ChronoDuration::hours(2),
            now - ChronoDuration::hours(1),
            "missed",
            now - ChronoDuration::hours(3),
        );
        let stale = store.insert_booking(stale).await.unwrap();

        let handle = spawn_expiry_sweep(engine.clone(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.abort();

        let booking = engine.get_booking(&stale.id).await.unwrap();
        assert_eq!(booking.status, ibroker_core::BookingStatus::Expired);
    }
}
