use crate::error::BrokerError;
use crate::types::{
    AgentId, AgentProfile, Booking, BookingId, BookingStatus, CaseId, ExceptionCase, UserId,
    UserPolicy, UserPolicyId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Record persistence backend configuration.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    /// Keep all records in process memory only.
    Memory,
    /// Persist records in PostgreSQL.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// Build a store from configuration.
pub async fn bootstrap_store(config: StoreConfig) -> Result<SharedStore, BrokerError> {
    match config {
        StoreConfig::Memory => Ok(std::sync::Arc::new(MemoryStore::new())),
        StoreConfig::Postgres {
            database_url,
            max_connections,
        } => {
            let store = PostgresStore::connect(&database_url, max_connections).await?;
            store.ensure_schema().await?;
            Ok(std::sync::Arc::new(store))
        }
    }
}

pub type SharedStore = std::sync::Arc<dyn RecordStore>;

/// Optional filters for booking listings.
#[derive(Debug, Clone, Default)]
pub struct BookingFilter {
    pub user_id: Option<UserId>,
    pub agent_id: Option<AgentId>,
}

/// Durable storage for the four workflow record families.
///
/// Updates are optimistic: the caller passes back the record at the
/// version it read, and the store either persists it at `version + 1` or
/// fails with a conflict. The `(agent_id, start_time)` pair of live
/// bookings is unique at the store level, so two concurrent creations of
/// the same slot can never both succeed.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_booking(&self, booking: Booking) -> Result<Booking, BrokerError>;
    async fn get_booking(&self, id: &BookingId) -> Result<Booking, BrokerError>;
    async fn update_booking(&self, booking: Booking) -> Result<Booking, BrokerError>;
    async fn list_bookings(&self, filter: BookingFilter) -> Result<Vec<Booking>, BrokerError>;
    /// Live bookings whose slot has already ended.
    async fn bookings_due_for_expiry(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Booking>, BrokerError>;

    async fn insert_user_policy(&self, policy: UserPolicy) -> Result<UserPolicy, BrokerError>;
    async fn get_user_policy(&self, id: &UserPolicyId) -> Result<UserPolicy, BrokerError>;
    async fn update_user_policy(&self, policy: UserPolicy) -> Result<UserPolicy, BrokerError>;
    async fn list_user_policies(
        &self,
        user_id: Option<&UserId>,
    ) -> Result<Vec<UserPolicy>, BrokerError>;

    async fn insert_case(&self, case: ExceptionCase) -> Result<ExceptionCase, BrokerError>;
    async fn get_case(&self, id: &CaseId) -> Result<ExceptionCase, BrokerError>;
    async fn update_case(&self, case: ExceptionCase) -> Result<ExceptionCase, BrokerError>;
    async fn list_cases(&self, only_open: bool) -> Result<Vec<ExceptionCase>, BrokerError>;

    async fn insert_agent(&self, agent: AgentProfile) -> Result<AgentProfile, BrokerError>;
    async fn get_agent(&self, id: &AgentId) -> Result<AgentProfile, BrokerError>;
    async fn update_agent(&self, agent: AgentProfile) -> Result<AgentProfile, BrokerError>;
    async fn list_agents(&self) -> Result<Vec<AgentProfile>, BrokerError>;
}

// ── In-memory backend ────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    bookings: HashMap<String, Booking>,
    user_policies: HashMap<String, UserPolicy>,
    cases: HashMap<String, ExceptionCase>,
    agents: HashMap<String, AgentProfile>,
    /// Reserved `(agent_id, start_time)` pairs of live bookings.
    slots: HashSet<(String, DateTime<Utc>)>,
}

/// Authoritative in-memory store used for tests and single-node runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn slot_key(booking: &Booking) -> (String, DateTime<Utc>) {
    (booking.agent_id.0.clone(), booking.start_time)
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_booking(&self, mut booking: Booking) -> Result<Booking, BrokerError> {
        let mut inner = self.inner.write().await;
        let key = slot_key(&booking);
        if inner.slots.contains(&key) {
            return Err(BrokerError::Conflict(format!(
                "slot {} for agent {} is already reserved",
                booking.start_time, booking.agent_id
            )));
        }
        if inner.bookings.contains_key(booking.id.as_str()) {
            return Err(BrokerError::Conflict(format!(
                "booking {} already exists",
                booking.id
            )));
        }
        booking.version = 1;
        inner.slots.insert(key);
        inner
            .bookings
            .insert(booking.id.0.clone(), booking.clone());
        Ok(booking)
    }

    async fn get_booking(&self, id: &BookingId) -> Result<Booking, BrokerError> {
        let inner = self.inner.read().await;
        inner
            .bookings
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(format!("booking {id}")))
    }

    async fn update_booking(&self, mut booking: Booking) -> Result<Booking, BrokerError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .bookings
            .get(booking.id.as_str())
            .ok_or_else(|| BrokerError::NotFound(format!("booking {}", booking.id)))?;
        if stored.version != booking.version {
            return Err(BrokerError::Conflict(format!(
                "booking {} was updated concurrently (stored v{}, caller v{})",
                booking.id, stored.version, booking.version
            )));
        }
        booking.version += 1;
        if booking.is_terminal() {
            inner.slots.remove(&slot_key(&booking));
        }
        inner
            .bookings
            .insert(booking.id.0.clone(), booking.clone());
        Ok(booking)
    }

    async fn list_bookings(&self, filter: BookingFilter) -> Result<Vec<Booking>, BrokerError> {
        let inner = self.inner.read().await;
        let mut bookings: Vec<Booking> = inner
            .bookings
            .values()
            .filter(|b| {
                filter
                    .user_id
                    .as_ref()
                    .map(|u| &b.user_id == u)
                    .unwrap_or(true)
                    && filter
                        .agent_id
                        .as_ref()
                        .map(|a| &b.agent_id == a)
                        .unwrap_or(true)
            })
            .cloned()
            .collect();
        bookings.sort_by_key(|b| b.created_at);
        Ok(bookings)
    }

    async fn bookings_due_for_expiry(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Booking>, BrokerError> {
        let inner = self.inner.read().await;
        let mut due: Vec<Booking> = inner
            .bookings
            .values()
            .filter(|b| {
                matches!(b.status, BookingStatus::Pending | BookingStatus::Approved)
                    && b.end_time < now
            })
            .cloned()
            .collect();
        due.sort_by_key(|b| b.end_time);
        Ok(due)
    }

    async fn insert_user_policy(&self, mut policy: UserPolicy) -> Result<UserPolicy, BrokerError> {
        let mut inner = self.inner.write().await;
        if inner.user_policies.contains_key(policy.id.as_str()) {
            return Err(BrokerError::Conflict(format!(
                "user policy {} already exists",
                policy.id
            )));
        }
        policy.version = 1;
        inner
            .user_policies
            .insert(policy.id.0.clone(), policy.clone());
        Ok(policy)
    }

    async fn get_user_policy(&self, id: &UserPolicyId) -> Result<UserPolicy, BrokerError> {
        let inner = self.inner.read().await;
        inner
            .user_policies
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(format!("user policy {id}")))
    }

    async fn update_user_policy(&self, mut policy: UserPolicy) -> Result<UserPolicy, BrokerError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .user_policies
            .get(policy.id.as_str())
            .ok_or_else(|| BrokerError::NotFound(format!("user policy {}", policy.id)))?;
        if stored.version != policy.version {
            return Err(BrokerError::Conflict(format!(
                "user policy {} was updated concurrently",
                policy.id
            )));
        }
        policy.version += 1;
        inner
            .user_policies
            .insert(policy.id.0.clone(), policy.clone());
        Ok(policy)
    }

    async fn list_user_policies(
        &self,
        user_id: Option<&UserId>,
    ) -> Result<Vec<UserPolicy>, BrokerError> {
        let inner = self.inner.read().await;
        let mut policies: Vec<UserPolicy> = inner
            .user_policies
            .values()
            .filter(|p| user_id.map(|u| &p.user_id == u).unwrap_or(true))
            .cloned()
            .collect();
        policies.sort_by_key(|p| p.created_at);
        Ok(policies)
    }

    async fn insert_case(&self, mut case: ExceptionCase) -> Result<ExceptionCase, BrokerError> {
        let mut inner = self.inner.write().await;
        if inner.cases.contains_key(case.case_id.as_str()) {
            return Err(BrokerError::Conflict(format!(
                "case {} already exists",
                case.case_id
            )));
        }
        case.version = 1;
        inner.cases.insert(case.case_id.0.clone(), case.clone());
        Ok(case)
    }

    async fn get_case(&self, id: &CaseId) -> Result<ExceptionCase, BrokerError> {
        let inner = self.inner.read().await;
        inner
            .cases
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(format!("case {id}")))
    }

    async fn update_case(&self, mut case: ExceptionCase) -> Result<ExceptionCase, BrokerError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .cases
            .get(case.case_id.as_str())
            .ok_or_else(|| BrokerError::NotFound(format!("case {}", case.case_id)))?;
        if stored.version != case.version {
            return Err(BrokerError::Conflict(format!(
                "case {} was updated concurrently",
                case.case_id
            )));
        }
        case.version += 1;
        inner.cases.insert(case.case_id.0.clone(), case.clone());
        Ok(case)
    }

    async fn list_cases(&self, only_open: bool) -> Result<Vec<ExceptionCase>, BrokerError> {
        let inner = self.inner.read().await;
        let mut cases: Vec<ExceptionCase> = inner
            .cases
            .values()
            .filter(|c| !only_open || c.is_open())
            .cloned()
            .collect();
        cases.sort_by_key(|c| c.created_at);
        Ok(cases)
    }

    async fn insert_agent(&self, mut agent: AgentProfile) -> Result<AgentProfile, BrokerError> {
        let mut inner = self.inner.write().await;
        if inner.agents.contains_key(agent.agent_id.as_str()) {
            return Err(BrokerError::Conflict(format!(
                "agent {} already exists",
                agent.agent_id
            )));
        }
        agent.version = 1;
        inner.agents.insert(agent.agent_id.0.clone(), agent.clone());
        Ok(agent)
    }

    async fn get_agent(&self, id: &AgentId) -> Result<AgentProfile, BrokerError> {
        let inner = self.inner.read().await;
        inner
            .agents
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(format!("agent {id}")))
    }

    async fn update_agent(&self, mut agent: AgentProfile) -> Result<AgentProfile, BrokerError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .agents
            .get(agent.agent_id.as_str())
            .ok_or_else(|| BrokerError::NotFound(format!("agent {}", agent.agent_id)))?;
        if stored.version != agent.version {
            return Err(BrokerError::Conflict(format!(
                "agent {} was updated concurrently",
                agent.agent_id
            )));
        }
        agent.version += 1;
        inner.agents.insert(agent.agent_id.0.clone(), agent.clone());
        Ok(agent)
    }

    async fn list_agents(&self) -> Result<Vec<AgentProfile>, BrokerError> {
        let inner = self.inner.read().await;
        let mut agents: Vec<AgentProfile> = inner.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(agents)
    }
}

// ── PostgreSQL backend ───────────────────────────────────────────────

/// PostgreSQL-backed store. Each record family lives in one table with a
/// JSONB payload plus dedicated columns for keys and hot filters; a
/// partial unique index over live bookings enforces slot exclusivity.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, BrokerError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| BrokerError::Unavailable(format!("postgres connect failed: {e}")))?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), BrokerError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS ibroker_bookings (
                id TEXT PRIMARY KEY,
                version BIGINT NOT NULL,
                user_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                status TEXT NOT NULL,
                start_time TIMESTAMPTZ NOT NULL,
                end_time TIMESTAMPTZ NOT NULL,
                payload JSONB NOT NULL
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_ibroker_bookings_slot
                ON ibroker_bookings (agent_id, start_time)
                WHERE status IN ('pending', 'approved')
            "#,
            "CREATE INDEX IF NOT EXISTS idx_ibroker_bookings_user ON ibroker_bookings (user_id)",
            r#"
            CREATE TABLE IF NOT EXISTS ibroker_user_policies (
                id TEXT PRIMARY KEY,
                version BIGINT NOT NULL,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                payload JSONB NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_ibroker_user_policies_user ON ibroker_user_policies (user_id)",
            r#"
            CREATE TABLE IF NOT EXISTS ibroker_exception_cases (
                id TEXT PRIMARY KEY,
                version BIGINT NOT NULL,
                status TEXT NOT NULL,
                payload JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ibroker_agents (
                id TEXT PRIMARY KEY,
                version BIGINT NOT NULL,
                is_active BOOLEAN NOT NULL,
                payload JSONB NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| BrokerError::Store(format!("postgres schema create failed: {e}")))?;
        }
        Ok(())
    }
}

fn map_sqlx(context: &str, error: sqlx::Error) -> BrokerError {
    match &error {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            BrokerError::Unavailable(format!("{context}: {error}"))
        }
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            BrokerError::Conflict(format!("{context}: uniqueness violated"))
        }
        _ => BrokerError::Store(format!("{context}: {error}")),
    }
}

fn to_payload<T: serde::Serialize>(record: &T) -> Result<serde_json::Value, BrokerError> {
    serde_json::to_value(record).map_err(|e| BrokerError::Serialization(e.to_string()))
}

fn from_payload<T: serde::de::DeserializeOwned>(
    row: &sqlx::postgres::PgRow,
) -> Result<T, BrokerError> {
    let payload: serde_json::Value = row
        .try_get("payload")
        .map_err(|e| BrokerError::Store(format!("postgres decode payload failed: {e}")))?;
    serde_json::from_value(payload).map_err(|e| BrokerError::Serialization(e.to_string()))
}

fn version_i64(version: u64, context: &str) -> Result<i64, BrokerError> {
    version
        .try_into()
        .map_err(|_| BrokerError::Store(format!("{context}: version exceeds BIGINT range")))
}

#[async_trait]
impl RecordStore for PostgresStore {
    async fn insert_booking(&self, mut booking: Booking) -> Result<Booking, BrokerError> {
        booking.version = 1;
        sqlx::query(
            r#"
            INSERT INTO ibroker_bookings
                (id, version, user_id, agent_id, status, start_time, end_time, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(booking.id.as_str())
        .bind(version_i64(booking.version, "insert booking")?)
        .bind(booking.user_id.as_str())
        .bind(booking.agent_id.as_str())
        .bind(booking.status.name())
        .bind(booking.start_time)
        .bind(booking.end_time)
        .bind(to_payload(&booking)?)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("insert booking", e))?;
        Ok(booking)
    }

    async fn get_booking(&self, id: &BookingId) -> Result<Booking, BrokerError> {
        let row = sqlx::query("SELECT payload FROM ibroker_bookings WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx("get booking", e))?
            .ok_or_else(|| BrokerError::NotFound(format!("booking {id}")))?;
        from_payload(&row)
    }

    async fn update_booking(&self, mut booking: Booking) -> Result<Booking, BrokerError> {
        let expected = version_i64(booking.version, "update booking")?;
        booking.version += 1;
        let result = sqlx::query(
            r#"
            UPDATE ibroker_bookings
            SET version = $2, status = $3, payload = $4
            WHERE id = $1 AND version = $5
            "#,
        )
        .bind(booking.id.as_str())
        .bind(version_i64(booking.version, "update booking")?)
        .bind(booking.status.name())
        .bind(to_payload(&booking)?)
        .bind(expected)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("update booking", e))?;

        if result.rows_affected() == 0 {
            // Distinguish a lost race from a missing record.
            let exists = sqlx::query("SELECT 1 FROM ibroker_bookings WHERE id = $1")
                .bind(booking.id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx("update booking", e))?;
            return match exists {
                Some(_) => Err(BrokerError::Conflict(format!(
                    "booking {} was updated concurrently",
                    booking.id
                ))),
                None => Err(BrokerError::NotFound(format!("booking {}", booking.id))),
            };
        }
        Ok(booking)
    }

    async fn list_bookings(&self, filter: BookingFilter) -> Result<Vec<Booking>, BrokerError> {
        let rows = sqlx::query(
            r#"
            SELECT payload FROM ibroker_bookings
            WHERE ($1::TEXT IS NULL OR user_id = $1)
              AND ($2::TEXT IS NULL OR agent_id = $2)
            ORDER BY start_time ASC
            "#,
        )
        .bind(filter.user_id.as_ref().map(|u| u.as_str().to_string()))
        .bind(filter.agent_id.as_ref().map(|a| a.as_str().to_string()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("list bookings", e))?;
        rows.iter().map(from_payload).collect()
    }

    async fn bookings_due_for_expiry(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Booking>, BrokerError> {
        let rows = sqlx::query(
            r#"
            SELECT payload FROM ibroker_bookings
            WHERE status IN ('pending', 'approved') AND end_time < $1
            ORDER BY end_time ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("bookings due for expiry", e))?;
        rows.iter().map(from_payload).collect()
    }

    async fn insert_user_policy(&self, mut policy: UserPolicy) -> Result<UserPolicy, BrokerError> {
        policy.version = 1;
        sqlx::query(
            r#"
            INSERT INTO ibroker_user_policies (id, version, user_id, status, payload)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(policy.id.as_str())
        .bind(version_i64(policy.version, "insert user policy")?)
        .bind(policy.user_id.as_str())
        .bind(policy.status.name())
        .bind(to_payload(&policy)?)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("insert user policy", e))?;
        Ok(policy)
    }

    async fn get_user_policy(&self, id: &UserPolicyId) -> Result<UserPolicy, BrokerError> {
        let row = sqlx::query("SELECT payload FROM ibroker_user_policies WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx("get user policy", e))?
            .ok_or_else(|| BrokerError::NotFound(format!("user policy {id}")))?;
        from_payload(&row)
    }

    async fn update_user_policy(&self, mut policy: UserPolicy) -> Result<UserPolicy, BrokerError> {
        let expected = version_i64(policy.version, "update user policy")?;
        policy.version += 1;
        let result = sqlx::query(
            r#"
            UPDATE ibroker_user_policies
            SET version = $2, status = $3, payload = $4
            WHERE id = $1 AND version = $5
            "#,
        )
        .bind(policy.id.as_str())
        .bind(version_i64(policy.version, "update user policy")?)
        .bind(policy.status.name())
        .bind(to_payload(&policy)?)
        .bind(expected)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("update user policy", e))?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM ibroker_user_policies WHERE id = $1")
                .bind(policy.id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx("update user policy", e))?;
            return match exists {
                Some(_) => Err(BrokerError::Conflict(format!(
                    "user policy {} was updated concurrently",
                    policy.id
                ))),
                None => Err(BrokerError::NotFound(format!("user policy {}", policy.id))),
            };
        }
        Ok(policy)
    }

    async fn list_user_policies(
        &self,
        user_id: Option<&UserId>,
    ) -> Result<Vec<UserPolicy>, BrokerError> {
        let rows = sqlx::query(
            r#"
            SELECT payload FROM ibroker_user_policies
            WHERE ($1::TEXT IS NULL OR user_id = $1)
            ORDER BY id ASC
            "#,
        )
        .bind(user_id.map(|u| u.as_str().to_string()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("list user policies", e))?;
        rows.iter().map(from_payload).collect()
    }

    async fn insert_case(&self, mut case: ExceptionCase) -> Result<ExceptionCase, BrokerError> {
        case.version = 1;
        sqlx::query(
            r#"
            INSERT INTO ibroker_exception_cases (id, version, status, payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(case.case_id.as_str())
        .bind(version_i64(case.version, "insert case")?)
        .bind(case.status.name())
        .bind(to_payload(&case)?)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("insert case", e))?;
        Ok(case)
    }

    async fn get_case(&self, id: &CaseId) -> Result<ExceptionCase, BrokerError> {
        let row = sqlx::query("SELECT payload FROM ibroker_exception_cases WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx("get case", e))?
            .ok_or_else(|| BrokerError::NotFound(format!("case {id}")))?;
        from_payload(&row)
    }

    async fn update_case(&self, mut case: ExceptionCase) -> Result<ExceptionCase, BrokerError> {
        let expected = version_i64(case.version, "update case")?;
        case.version += 1;
        let result = sqlx::query(
            r#"
            UPDATE ibroker_exception_cases
            SET version = $2, status = $3, payload = $4
            WHERE id = $1 AND version = $5
            "#,
        )
        .bind(case.case_id.as_str())
        .bind(version_i64(case.version, "update case")?)
        .bind(case.status.name())
        .bind(to_payload(&case)?)
        .bind(expected)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("update case", e))?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM ibroker_exception_cases WHERE id = $1")
                .bind(case.case_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx("update case", e))?;
            return match exists {
                Some(_) => Err(BrokerError::Conflict(format!(
                    "case {} was updated concurrently",
                    case.case_id
                ))),
                None => Err(BrokerError::NotFound(format!("case {}", case.case_id))),
            };
        }
        Ok(case)
    }

    async fn list_cases(&self, only_open: bool) -> Result<Vec<ExceptionCase>, BrokerError> {
        let rows = sqlx::query(
            r#"
            SELECT payload FROM ibroker_exception_cases
            WHERE ($1 = FALSE OR status IN ('pending', 'under_review'))
            ORDER BY id ASC
            "#,
        )
        .bind(only_open)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("list cases", e))?;
        rows.iter().map(from_payload).collect()
    }

    async fn insert_agent(&self, mut agent: AgentProfile) -> Result<AgentProfile, BrokerError> {
        agent.version = 1;
        sqlx::query(
            r#"
            INSERT INTO ibroker_agents (id, version, is_active, payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(agent.agent_id.as_str())
        .bind(version_i64(agent.version, "insert agent")?)
        .bind(agent.is_active)
        .bind(to_payload(&agent)?)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("insert agent", e))?;
        Ok(agent)
    }

    async fn get_agent(&self, id: &AgentId) -> Result<AgentProfile, BrokerError> {
        let row = sqlx::query("SELECT payload FROM ibroker_agents WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx("get agent", e))?
            .ok_or_else(|| BrokerError::NotFound(format!("agent {id}")))?;
        from_payload(&row)
    }

    async fn update_agent(&self, mut agent: AgentProfile) -> Result<AgentProfile, BrokerError> {
        let expected = version_i64(agent.version, "update agent")?;
        agent.version += 1;
        let result = sqlx::query(
            r#"
            UPDATE ibroker_agents
            SET version = $2, is_active = $3, payload = $4
            WHERE id = $1 AND version = $5
            "#,
        )
        .bind(agent.agent_id.as_str())
        .bind(version_i64(agent.version, "update agent")?)
        .bind(agent.is_active)
        .bind(to_payload(&agent)?)
        .bind(expected)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("update agent", e))?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM ibroker_agents WHERE id = $1")
                .bind(agent.agent_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx("update agent", e))?;
            return match exists {
                Some(_) => Err(BrokerError::Conflict(format!(
                    "agent {} was updated concurrently",
                    agent.agent_id
                ))),
                None => Err(BrokerError::NotFound(format!("agent {}", agent.agent_id))),
            };
        }
        Ok(agent)
    }

    async fn list_agents(&self) -> Result<Vec<AgentProfile>, BrokerError> {
        let rows = sqlx::query("SELECT payload FROM ibroker_agents ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx("list agents", e))?;
        rows.iter().map(from_payload).collect()
    }
}
