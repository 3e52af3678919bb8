//! Append-only, hash-chained audit writer (spec §4.3).
//!
//! Grounded on the teacher's own `AuditLogger` — a single `append` write path
//! that seeds `prev_hash` from the last record and seals the new one before
//! persisting — but the single-writer property here is NOT the teacher's
//! process-local `RwLock`. It's the database's advisory lock, held for the
//! duration of the append transaction, so it stays correct across multiple
//! gateway instances sharing one Postgres (spec §9).

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::domain::{AuditEvent, AuditEventDraft, Decision};
use crate::error::GatewayError;
use crate::hash_chain::seal;

/// Arbitrary, fixed key for the audit table's advisory lock. Any two
/// processes calling `pg_advisory_xact_lock` with this constant serialize
/// against each other regardless of which one holds it first.
const AUDIT_ADVISORY_LOCK_KEY: i64 = 0x43415346_41554449; // "CASF" "AUDI" in ASCII hex, arbitrary

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, draft: AuditEventDraft) -> Result<AuditEvent, GatewayError>;

    /// All events in insertion order, for `verify_chain` (the CLI digest
    /// exporter and the chain-continuity property tests both need this).
    async fn all_events(&self) -> Result<Vec<AuditEvent>, GatewayError>;
}

pub struct PgAuditStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgAuditStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn append_inner(&self, draft: AuditEventDraft) -> Result<AuditEvent, GatewayError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| GatewayError::AuditUnavailable(e.to_string()))?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(AUDIT_ADVISORY_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|e| GatewayError::AuditUnavailable(e.to_string()))?;

        let prev_hash: String = sqlx::query(
            "SELECT hash FROM audit_events ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| GatewayError::AuditUnavailable(e.to_string()))?
        .map(|row| row.get::<String, _>("hash"))
        .unwrap_or_default();

        let event = seal(prev_hash, draft);
        let decision_str = match event.decision {
            Decision::Allow => "ALLOW",
            Decision::Deny => "DENY",
        };

        sqlx::query(
            "INSERT INTO audit_events
                (request_id, event_id, ts, actor, action, decision, payload, prev_hash, hash)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(event.request_id)
        .bind(event.event_id)
        .bind(event.ts)
        .bind(&event.actor)
        .bind(&event.action)
        .bind(decision_str)
        .bind(&event.payload)
        .bind(&event.prev_hash)
        .bind(&event.hash)
        .execute(&mut *tx)
        .await
        .map_err(|e| GatewayError::AuditUnavailable(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| GatewayError::AuditUnavailable(e.to_string()))?;

        Ok(event)
    }

    async fn all_events_inner(&self) -> Result<Vec<AuditEvent>, GatewayError> {
        let rows = sqlx::query(
            "SELECT request_id, event_id, ts, actor, action, decision, payload, prev_hash, hash
             FROM audit_events ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| GatewayError::AuditUnavailable(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let decision_str: String = row.get("decision");
                let decision = match decision_str.as_str() {
                    "ALLOW" => Decision::Allow,
                    _ => Decision::Deny,
                };
                Ok(AuditEvent {
                    request_id: row.get("request_id"),
                    event_id: row.get("event_id"),
                    ts: row.get("ts"),
                    actor: row.get("actor"),
                    action: row.get("action"),
                    decision,
                    payload: row.get("payload"),
                    prev_hash: row.get("prev_hash"),
                    hash: row.get("hash"),
                })
            })
            .collect()
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn append(&self, draft: AuditEventDraft) -> Result<AuditEvent, GatewayError> {
        tokio::time::timeout(self.timeout, self.append_inner(draft))
            .await
            .map_err(|_| GatewayError::AuditUnavailable("audit append timed out".into()))?
    }

    async fn all_events(&self) -> Result<Vec<AuditEvent>, GatewayError> {
        tokio::time::timeout(self.timeout, self.all_events_inner())
            .await
            .map_err(|_| GatewayError::AuditUnavailable("audit read timed out".into()))?
    }
}

/// In-process audit store used by tests. Serializes appends behind a single
/// mutex the same way the real store serializes them behind an advisory lock
/// — a process-local mutex is fine here precisely because tests run in one
/// process (spec §9 forbids it only for the real, multi-instance deployment).
pub struct InMemoryAuditStore {
    events: tokio::sync::Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self {
            events: tokio::sync::Mutex::new(Vec::new()),
        }
    }
}

impl Default for InMemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, draft: AuditEventDraft) -> Result<AuditEvent, GatewayError> {
        let mut events = self.events.lock().await;
        let prev_hash = events.last().map(|e| e.hash.clone()).unwrap_or_default();
        let event = seal(prev_hash, draft);
        events.push(event.clone());
        Ok(event)
    }

    async fn all_events(&self) -> Result<Vec<AuditEvent>, GatewayError> {
        Ok(self.events.lock().await.clone())
    }
}

/// Always fails, for exercising `Audit_Unavailable` fail-closed paths.
pub struct UnavailableAuditStore;

#[async_trait]
impl AuditStore for UnavailableAuditStore {
    async fn append(&self, _draft: AuditEventDraft) -> Result<AuditEvent, GatewayError> {
        Err(GatewayError::AuditUnavailable("database offline".into()))
    }

    async fn all_events(&self) -> Result<Vec<AuditEvent>, GatewayError> {
        Err(GatewayError::AuditUnavailable("database offline".into()))
    }
}
