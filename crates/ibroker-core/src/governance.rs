//! Agent governance: who may act on which bookings.
//!
//! The engine consults this gate before accepting a booking or an agent
//! decision. A negative answer is surfaced as `AgentNotEligible` and is
//! never relaxed downstream.

use crate::error::BrokerError;
use crate::store::SharedStore;
use crate::types::{AgentId, AgentProfile};
use std::collections::BTreeSet;
use tracing::info;

/// Maximum re-reads when a derived-metric bump loses a version race.
const METRIC_RETRIES: usize = 3;

#[derive(Clone)]
pub struct AgentGovernance {
    store: SharedStore,
}

impl AgentGovernance {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn register(&self, profile: AgentProfile) -> Result<AgentProfile, BrokerError> {
        let stored = self.store.insert_agent(profile).await?;
        info!(agent = %stored.agent_id, "agent registered");
        Ok(stored)
    }

    /// May `agent_id` take on work for this policy type and region?
    ///
    /// Empty assignment sets mean unrestricted: a freshly registered agent
    /// serves everything until governance narrows it down.
    pub async fn can_assign(
        &self,
        agent_id: &AgentId,
        policy_type: Option<&str>,
        region: Option<&str>,
    ) -> Result<bool, BrokerError> {
        let agent = self.store.get_agent(agent_id).await?;
        if !agent.is_active {
            return Ok(false);
        }
        if let Some(region) = region {
            if !agent.assigned_regions.is_empty() && !agent.assigned_regions.contains(region) {
                return Ok(false);
            }
        }
        if let Some(policy_type) = policy_type {
            if !agent.assigned_policy_types.is_empty()
                && !agent.assigned_policy_types.contains(policy_type)
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Toggle activation. Deactivation requires a reason.
    pub async fn set_active(
        &self,
        agent_id: &AgentId,
        active: bool,
        reason: Option<&str>,
    ) -> Result<AgentProfile, BrokerError> {
        if !active && reason.map(str::trim).unwrap_or("").is_empty() {
            return Err(BrokerError::Validation(
                "deactivating an agent requires a reason".to_string(),
            ));
        }

        let mut agent = self.store.get_agent(agent_id).await?;
        agent.is_active = active;
        agent.deactivation_reason = if active {
            None
        } else {
            reason.map(|r| r.trim().to_string())
        };
        agent.updated_at = chrono::Utc::now();
        let stored = self.store.update_agent(agent).await?;
        info!(agent = %agent_id, active, "agent activation changed");
        Ok(stored)
    }

    pub async fn set_assignments(
        &self,
        agent_id: &AgentId,
        regions: BTreeSet<String>,
        policy_types: BTreeSet<String>,
    ) -> Result<AgentProfile, BrokerError> {
        let mut agent = self.store.get_agent(agent_id).await?;
        agent.assigned_regions = regions;
        agent.assigned_policy_types = policy_types;
        agent.updated_at = chrono::Utc::now();
        self.store.update_agent(agent).await
    }

    pub async fn get(&self, agent_id: &AgentId) -> Result<AgentProfile, BrokerError> {
        self.store.get_agent(agent_id).await
    }

    pub async fn list(&self) -> Result<Vec<AgentProfile>, BrokerError> {
        self.store.list_agents().await
    }

    // ── Derived metrics (engine-internal) ────────────────────────────

    pub(crate) async fn note_decision(
        &self,
        agent_id: &AgentId,
        approved: bool,
    ) -> Result<(), BrokerError> {
        self.bump(agent_id, |agent| agent.record_decision(approved))
            .await
    }

    pub(crate) async fn note_sla_breach(&self, agent_id: &AgentId) -> Result<(), BrokerError> {
        self.bump(agent_id, |agent| {
            agent.sla_breaches += 1;
            agent.updated_at = chrono::Utc::now();
        })
        .await
    }

    pub(crate) async fn note_escalation(&self, agent_id: &AgentId) -> Result<(), BrokerError> {
        self.bump(agent_id, |agent| {
            agent.escalated_cases += 1;
            agent.updated_at = chrono::Utc::now();
        })
        .await
    }

    pub(crate) async fn note_misconduct(&self, agent_id: &AgentId) -> Result<(), BrokerError> {
        self.bump(agent_id, |agent| {
            agent.misconduct_flags += 1;
            agent.updated_at = chrono::Utc::now();
        })
        .await
    }

    /// Suspend an agent as the cascade of a resolved misconduct case.
    pub(crate) async fn suspend_for_case(
        &self,
        agent_id: &AgentId,
        case_id: &str,
    ) -> Result<AgentProfile, BrokerError> {
        self.set_active(agent_id, false, Some(&format!("suspended by case {case_id}")))
            .await
    }

    /// Read-modify-write with bounded retries: metric bumps may race the
    /// decision path and simply re-apply on a fresh read.
    async fn bump<F>(&self, agent_id: &AgentId, mutate: F) -> Result<(), BrokerError>
    where
        F: Fn(&mut AgentProfile),
    {
        let mut last = None;
        for _ in 0..METRIC_RETRIES {
            let mut agent = self.store.get_agent(agent_id).await?;
            mutate(&mut agent);
            match self.store.update_agent(agent).await {
                Ok(_) => return Ok(()),
                Err(BrokerError::Conflict(msg)) => last = Some(msg),
                Err(other) => return Err(other),
            }
        }
        Err(BrokerError::Conflict(last.unwrap_or_else(|| {
            format!("metric update for agent {agent_id} kept conflicting")
        })))
    }
}
