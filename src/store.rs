//! Incident persistence with SQLite
//!
//! One database at `.remedy/remedy.db` holds incident snapshots (upserted
//! per status change), append-only plans, validations, rewards, and the
//! event log. The handle is cheap to clone and safe to share across tasks;
//! writes for distinct incidents never contend on anything but the
//! connection lock.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::model::{timestamp, Event, Incident, RepairPlan, RewardSignal, ValidationResult};

/// Default page size for list endpoints.
pub const LIST_LIMIT: usize = 200;

/// An event row as read back from the log.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: String,
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        Self::init(conn)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("Failed to configure database")?;
        conn.execute_batch(include_str!("store_schema.sql"))
            .context("Failed to apply database schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("store lock poisoned"))
    }

    // ========================================================================
    // Incidents
    // ========================================================================

    /// Persist the current snapshot of an incident, last write wins.
    pub fn upsert_incident(&self, incident: &Incident) -> Result<()> {
        let payload = serde_json::to_string(incident).context("Failed to serialize incident")?;
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO incidents (id, payload, status, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    incident.id,
                    payload,
                    incident.status.label(),
                    incident.created_at
                ],
            )
            .context("Failed to upsert incident")?;
        Ok(())
    }

    pub fn get_incident(&self, id: &str) -> Result<Option<Incident>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT payload FROM incidents WHERE id = ?1")
            .context("Failed to prepare incident lookup")?;
        let mut rows = stmt
            .query_map(params![id], |row| row.get::<_, String>(0))
            .context("Failed to query incident")?;
        match rows.next() {
            Some(payload) => {
                let payload = payload.context("Failed to read incident row")?;
                let incident = serde_json::from_str(&payload)
                    .context("Failed to parse stored incident payload")?;
                Ok(Some(incident))
            }
            None => Ok(None),
        }
    }

    /// Latest incident snapshots, newest first.
    pub fn list_incidents(&self, limit: usize) -> Result<Vec<Incident>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT payload FROM incidents ORDER BY created_at DESC LIMIT ?1")
            .context("Failed to prepare incident listing")?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))
            .context("Failed to list incidents")?;

        let mut incidents = Vec::new();
        for payload in rows {
            let payload = payload.context("Failed to read incident row")?;
            match serde_json::from_str(&payload) {
                Ok(incident) => incidents.push(incident),
                Err(err) => tracing::warn!(%err, "skipping unparseable incident row"),
            }
        }
        Ok(incidents)
    }

    // ========================================================================
    // Plans and validations
    // ========================================================================

    pub fn insert_plan(&self, plan: &RepairPlan) -> Result<()> {
        let payload = serde_json::to_string(plan).context("Failed to serialize plan")?;
        self.conn()?
            .execute(
                "INSERT INTO plans (incident_id, payload, created_at) VALUES (?1, ?2, ?3)",
                params![plan.incident_id, payload, timestamp()],
            )
            .context("Failed to insert plan")?;
        Ok(())
    }

    pub fn plans_for(&self, incident_id: &str) -> Result<Vec<RepairPlan>> {
        self.payloads_for("plans", incident_id)
    }

    pub fn insert_validation(&self, validation: &ValidationResult) -> Result<()> {
        let payload =
            serde_json::to_string(validation).context("Failed to serialize validation")?;
        self.conn()?
            .execute(
                "INSERT INTO validations (incident_id, payload, created_at) VALUES (?1, ?2, ?3)",
                params![validation.incident_id, payload, timestamp()],
            )
            .context("Failed to insert validation")?;
        Ok(())
    }

    pub fn validations_for(&self, incident_id: &str) -> Result<Vec<ValidationResult>> {
        self.payloads_for("validations", incident_id)
    }

    fn payloads_for<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        incident_id: &str,
    ) -> Result<Vec<T>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT payload FROM {} WHERE incident_id = ?1 ORDER BY rowid ASC",
                table
            ))
            .context("Failed to prepare payload query")?;
        let rows = stmt
            .query_map(params![incident_id], |row| row.get::<_, String>(0))
            .context("Failed to query payloads")?;

        let mut records = Vec::new();
        for payload in rows {
            let payload = payload.context("Failed to read payload row")?;
            records.push(
                serde_json::from_str(&payload).context("Failed to parse stored payload")?,
            );
        }
        Ok(records)
    }

    // ========================================================================
    // Rewards
    // ========================================================================

    /// Append one reward row. The schema rejects a second write for the same
    /// `(incident, attempt)` pair.
    pub fn insert_reward(&self, reward: &RewardSignal) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO rewards (incident_id, attempt, reward, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    reward.incident_id,
                    reward.attempt,
                    reward.reward,
                    timestamp()
                ],
            )
            .context("Failed to insert reward")?;
        Ok(())
    }

    pub fn rewards_for(&self, incident_id: &str) -> Result<Vec<RewardSignal>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT incident_id, attempt, reward FROM rewards
                 WHERE incident_id = ?1 ORDER BY attempt ASC",
            )
            .context("Failed to prepare reward query")?;
        let rows = stmt
            .query_map(params![incident_id], |row| {
                Ok(RewardSignal {
                    incident_id: row.get(0)?,
                    attempt: row.get(1)?,
                    reward: row.get(2)?,
                })
            })
            .context("Failed to query rewards")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read reward rows")
    }

    /// Most recent reward for an incident (highest attempt number).
    pub fn latest_reward(&self, incident_id: &str) -> Result<Option<RewardSignal>> {
        Ok(self.rewards_for(incident_id)?.pop())
    }

    /// Highest recorded attempt number for an incident, 0 when none. The
    /// orchestrator resumes numbering from here after a queue redelivery.
    ///
    /// Attempts that fail before validation leave an event but no reward,
    /// so the maximum is taken over both tables.
    pub fn latest_attempt(&self, incident_id: &str) -> Result<u32> {
        self.conn()?
            .query_row(
                "SELECT COALESCE(MAX(attempt), 0) FROM (
                   SELECT attempt FROM rewards WHERE incident_id = ?1
                   UNION ALL
                   SELECT CAST(json_extract(payload, '$.attempt') AS INTEGER)
                     FROM events WHERE incident_id = ?1 AND type = 'attempt'
                 )",
                params![incident_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u32)
            .context("Failed to read latest attempt")
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn insert_event(&self, event: &Event) -> Result<()> {
        let payload =
            serde_json::to_string(&event.payload).context("Failed to serialize event payload")?;
        self.conn()?
            .execute(
                "INSERT INTO events (type, incident_id, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![event.kind, event.incident_id, payload, event.created_at],
            )
            .context("Failed to insert event")?;
        Ok(())
    }

    /// Latest events across all incidents, newest first.
    pub fn list_events(&self, limit: usize) -> Result<Vec<StoredEvent>> {
        self.query_events(
            "SELECT id, type, incident_id, payload, created_at FROM events
             ORDER BY id DESC LIMIT ?1",
            params![limit as i64],
        )
    }

    /// Full event history for one incident, oldest first.
    pub fn events_for(&self, incident_id: &str) -> Result<Vec<StoredEvent>> {
        self.query_events(
            "SELECT id, type, incident_id, payload, created_at FROM events
             WHERE incident_id = ?1 ORDER BY id ASC",
            params![incident_id],
        )
    }

    fn query_events(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<StoredEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).context("Failed to prepare event query")?;
        let rows = stmt
            .query_map(params, |row| {
                let raw: String = row.get(3)?;
                Ok(StoredEvent {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    incident_id: row.get(2)?,
                    payload: serde_json::from_str(&raw)
                        .unwrap_or(serde_json::Value::String(raw)),
                    created_at: row.get(4)?,
                })
            })
            .context("Failed to query events")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read event rows")
    }
}
