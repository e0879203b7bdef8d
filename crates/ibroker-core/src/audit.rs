use crate::error::BrokerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Audit trail shared between the engine and the exception desk.
pub type SharedAudit = std::sync::Arc<tokio::sync::Mutex<AuditTrail>>;

/// Hash-chained entry recording one committed workflow transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: String,
    pub index: u64,
    /// Id of the booking/policy/case/agent the transition touched.
    pub record_id: String,
    /// Short event name, e.g. `booking_rejected`, `case_resolved`.
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

/// Append-only audit trail for workflow transitions.
///
/// No in-place mutation is exposed. Each entry hashes its predecessor,
/// so any tampering with history breaks `verify_chain`.
#[derive(Debug, Default, Clone)]
pub struct AuditTrail {
    entries: Vec<AuditEntry>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Rebuild from persisted entries, verifying index continuity and the
    /// hash chain.
    pub fn from_entries(entries: Vec<AuditEntry>) -> Result<Self, BrokerError> {
        let trail = Self { entries };

        for (expected_index, entry) in trail.entries.iter().enumerate() {
            if entry.index != expected_index as u64 {
                return Err(BrokerError::Store(format!(
                    "audit index gap at position {} (found {})",
                    expected_index, entry.index
                )));
            }
        }

        if !trail.verify_chain() {
            return Err(BrokerError::Store(
                "audit trail hash-chain verification failed".to_string(),
            ));
        }

        Ok(trail)
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn entries_for(&self, record_id: &str) -> Vec<&AuditEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.record_id == record_id)
            .collect()
    }

    pub fn append(
        &mut self,
        record_id: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
    ) -> AuditEntry {
        let index = self.entries.len() as u64;
        let previous_hash = self.entries.last().map(|entry| entry.entry_hash.clone());
        let record_id = record_id.into();
        let event = event.into();
        let timestamp = Utc::now();
        let entry_hash = compute_entry_hash(
            index,
            &record_id,
            &event,
            timestamp,
            &payload,
            previous_hash.as_deref(),
        );

        let entry = AuditEntry {
            entry_id: Uuid::new_v4().to_string(),
            index,
            record_id,
            event,
            timestamp,
            payload,
            previous_hash,
            entry_hash,
        };
        self.entries.push(entry.clone());
        entry
    }

    pub fn verify_chain(&self) -> bool {
        let mut previous_hash: Option<String> = None;
        for entry in &self.entries {
            let expected = compute_entry_hash(
                entry.index,
                &entry.record_id,
                &entry.event,
                entry.timestamp,
                &entry.payload,
                previous_hash.as_deref(),
            );
            if entry.entry_hash != expected || entry.previous_hash != previous_hash {
                return false;
            }
            previous_hash = Some(entry.entry_hash.clone());
        }
        true
    }
}

fn compute_entry_hash(
    index: u64,
    record_id: &str,
    event: &str,
    timestamp: DateTime<Utc>,
    payload: &Value,
    previous_hash: Option<&str>,
) -> String {
    let material = serde_json::json!({
        "index": index,
        "record_id": record_id,
        "event": event,
        "timestamp": timestamp,
        "payload": payload,
        "previous_hash": previous_hash,
    });

    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}
