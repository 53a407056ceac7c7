//! SQLite-backed evidence storage.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use thiserror::Error;

use crate::canonical::{canonical_json, CanonicalError};
use crate::chain::{chain_hash, ChainEvent};
use crate::types::{
    Decision, ExecStatus, ExecutionResult, PolicyResult, ToolCallEnvelope, ToolCallRequest,
    ToolCallResponse,
};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Extended SQLite result codes for constraint classes we branch on.
const SQLITE_CONSTRAINT_PRIMARYKEY: i32 = 1555;
const SQLITE_CONSTRAINT_UNIQUE: i32 = 2067;

/// Errors that can occur during evidence operations.
#[derive(Debug, Error)]
pub enum EvidenceError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Canonicalization failed.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A stored row contradicts the schema's invariants.
    #[error("corrupt evidence row: {0}")]
    Corrupt(String),
}

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>, EvidenceError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| EvidenceError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn parse_decision(s: &str) -> Result<Decision, EvidenceError> {
    Decision::parse(s).ok_or_else(|| EvidenceError::Corrupt(format!("unknown decision {s:?}")))
}

/// Persists tool-call events and execution results.
///
/// Cloning is cheap; all clones share one connection.
#[derive(Clone)]
pub struct EvidenceStore {
    conn: Arc<Mutex<Connection>>,
}

impl EvidenceStore {
    /// Opens (or creates) the evidence store at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EvidenceError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, EvidenceError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // Poisoning means another thread panicked mid-write; nothing to recover.
        self.conn.lock().expect("evidence store mutex poisoned")
    }

    /// Liveness probe for readiness checks.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable.
    pub fn ping(&self) -> Result<(), EvidenceError> {
        self.conn().query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    /// Appends an event (and its optional result) to the tenant's chain.
    ///
    /// Runs in one immediate transaction: reads the tenant's last hash,
    /// canonicalizes payload and result, computes the chain hash, inserts
    /// the rows, and commits. The envelope's `hash`, `prev_hash`, and
    /// `event_seq` are written back only after the commit succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error on any storage or serialization failure; the
    /// transaction is rolled back and the envelope is left untouched.
    pub fn record_event(&self, env: &mut ToolCallEnvelope) -> Result<(), EvidenceError> {
        let canon_payload = String::from_utf8(canonical_json(&env.request)?)
            .map_err(|e| EvidenceError::Corrupt(format!("canonical payload not utf-8: {e}")))?;
        let canon_result = match &env.execution_result {
            Some(result) => Some(
                String::from_utf8(canonical_json(result)?).map_err(|e| {
                    EvidenceError::Corrupt(format!("canonical result not utf-8: {e}"))
                })?,
            ),
            None => None,
        };
        let payload_json = serde_json::to_string(&env.request)?;
        let policy_json = match &env.policy_result {
            Some(result) => Some(serde_json::to_string(result)?),
            None => None,
        };
        let requested_at = env.request.requested_at.unwrap_or(env.received_at);

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let prev_hash: String = tx
            .query_row(
                "SELECT hash FROM tool_events
                 WHERE tenant_id = ?1
                 ORDER BY event_seq DESC LIMIT 1",
                params![env.request.tenant_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or_default();

        let hash = chain_hash(
            &prev_hash,
            canon_payload.as_bytes(),
            canon_result.as_deref().map(str::as_bytes),
        );

        tx.execute(
            "INSERT INTO tool_events (
                event_id, tenant_id, agent_id, tool, action,
                payload_json, payload_canon,
                risk_score, decision, policy_result,
                idempotency_key, session_id, user_id, source_ip, trace_id,
                received_at, requested_at,
                hash, prev_hash
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5,
                ?6, ?7,
                ?8, ?9, ?10,
                ?11, ?12, ?13, ?14, ?15,
                ?16, ?17,
                ?18, ?19
            )",
            params![
                env.event_id,
                env.request.tenant_id,
                env.request.agent_id,
                env.request.tool,
                env.request.action,
                payload_json,
                canon_payload,
                env.request.risk_score,
                env.decision.as_str(),
                policy_json,
                env.request.idempotency_key,
                env.request.session_id,
                env.request.user_id,
                env.request.source_ip,
                env.request.trace_id,
                to_ms(env.received_at),
                to_ms(requested_at),
                hash,
                prev_hash,
            ],
        )?;
        let event_seq = tx.last_insert_rowid();

        if let (Some(result), Some(canon)) = (&env.execution_result, &canon_result) {
            let output_json = match &result.output_json {
                Some(output) => Some(serde_json::to_string(output)?),
                None => None,
            };
            tx.execute(
                "INSERT INTO tool_results (
                    event_id, tenant_id, status, output_json, error_msg, duration_ms, result_canon
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    env.event_id,
                    env.request.tenant_id,
                    result.status.as_str(),
                    output_json,
                    result.error,
                    result.duration_ms,
                    canon,
                ],
            )?;
        }

        tx.commit()?;

        env.hash = hash;
        env.prev_hash = prev_hash;
        env.event_seq = Some(event_seq);
        Ok(())
    }

    /// Returns the prior response for `(tenant, idempotency_key)`, if any.
    ///
    /// The replay carries the recorded decision and, when the prior event
    /// executed, its execution result.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure (callers fail closed).
    pub fn check_idempotency(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<ToolCallResponse>, EvidenceError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT e.event_id, e.decision,
                        r.status, r.output_json, r.error_msg, r.duration_ms
                 FROM tool_events e
                 LEFT JOIN tool_results r ON r.event_id = e.event_id
                 WHERE e.tenant_id = ?1 AND e.idempotency_key = ?2
                 LIMIT 1",
                params![tenant_id, idempotency_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((event_id, decision, status, output_json, error_msg, duration_ms)) = row else {
            return Ok(None);
        };

        let result = match status {
            Some(status) => Some(ExecutionResult {
                status: ExecStatus::parse_lossy(&status),
                output_json: output_json.as_deref().map(serde_json::from_str).transpose()?,
                error: error_msg.unwrap_or_default(),
                duration_ms: duration_ms.unwrap_or_default(),
            }),
            None => None,
        };

        Ok(Some(ToolCallResponse {
            event_id,
            decision: parse_decision(&decision)?,
            reason: "idempotent replay".to_string(),
            approval_url: None,
            result,
        }))
    }

    /// Retrieves a single event by id, joined with its optional result.
    ///
    /// The original request is reconstructed from the stored canonical
    /// payload (so a resume can replay params and resource), then the
    /// persisted columns overlay it as authoritative.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or a corrupt row.
    pub fn get_event(&self, event_id: &str) -> Result<Option<ToolCallEnvelope>, EvidenceError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT e.event_seq, e.tenant_id, e.agent_id, e.tool, e.action,
                        e.payload_canon, e.risk_score, e.decision, e.policy_result,
                        e.idempotency_key, e.session_id, e.user_id, e.source_ip, e.trace_id,
                        e.received_at, e.requested_at, e.hash, e.prev_hash,
                        r.status, r.output_json, r.error_msg, r.duration_ms
                 FROM tool_events e
                 LEFT JOIN tool_results r ON r.event_id = e.event_id
                 WHERE e.event_id = ?1",
                params![event_id],
                |row| {
                    Ok(EventRow {
                        event_seq: row.get(0)?,
                        tenant_id: row.get(1)?,
                        agent_id: row.get(2)?,
                        tool: row.get(3)?,
                        action: row.get(4)?,
                        payload_canon: row.get(5)?,
                        risk_score: row.get(6)?,
                        decision: row.get(7)?,
                        policy_result: row.get(8)?,
                        idempotency_key: row.get(9)?,
                        session_id: row.get(10)?,
                        user_id: row.get(11)?,
                        source_ip: row.get(12)?,
                        trace_id: row.get(13)?,
                        received_at: row.get(14)?,
                        requested_at: row.get(15)?,
                        hash: row.get(16)?,
                        prev_hash: row.get(17)?,
                        result_status: row.get(18)?,
                        result_output: row.get(19)?,
                        result_error: row.get(20)?,
                        result_duration_ms: row.get(21)?,
                    })
                },
            )
            .optional()?;

        let Some(row) = row else { return Ok(None) };

        let mut request: ToolCallRequest = serde_json::from_str(&row.payload_canon)?;
        request.tenant_id = row.tenant_id;
        request.agent_id = row.agent_id;
        request.tool = row.tool;
        request.action = row.action;
        request.risk_score = row.risk_score;
        request.idempotency_key = row.idempotency_key;
        request.session_id = row.session_id;
        request.user_id = row.user_id;
        request.source_ip = row.source_ip;
        request.trace_id = row.trace_id;
        request.requested_at = Some(from_ms(row.requested_at)?);

        let policy_result: Option<PolicyResult> =
            row.policy_result.as_deref().map(serde_json::from_str).transpose()?;
        let execution_result = match row.result_status {
            Some(status) => Some(ExecutionResult {
                status: ExecStatus::parse_lossy(&status),
                output_json: row
                    .result_output
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()?,
                error: row.result_error.unwrap_or_default(),
                duration_ms: row.result_duration_ms.unwrap_or_default(),
            }),
            None => None,
        };

        Ok(Some(ToolCallEnvelope {
            event_seq: Some(row.event_seq),
            event_id: event_id.to_string(),
            request,
            received_at: from_ms(row.received_at)?,
            decision: parse_decision(&row.decision)?,
            policy_result,
            execution_result,
            hash: row.hash,
            prev_hash: row.prev_hash,
        }))
    }

    /// Returns the canonical execution response recorded for a parent
    /// approve event, used for idempotent execute replays.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn get_execution_by_parent(
        &self,
        parent_event_id: &str,
    ) -> Result<Option<ToolCallResponse>, EvidenceError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT x.execution_event_id,
                        r.status, r.output_json, r.error_msg, r.duration_ms
                 FROM tool_executions x
                 LEFT JOIN tool_results r ON r.event_id = x.execution_event_id
                 WHERE x.parent_event_id = ?1",
                params![parent_event_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((execution_event_id, status, output_json, error_msg, duration_ms)) = row else {
            return Ok(None);
        };

        let result = match status {
            Some(status) => Some(ExecutionResult {
                status: ExecStatus::parse_lossy(&status),
                output_json: output_json.as_deref().map(serde_json::from_str).transpose()?,
                error: error_msg.unwrap_or_default(),
                duration_ms: duration_ms.unwrap_or_default(),
            }),
            None => None,
        };

        Ok(Some(ToolCallResponse {
            event_id: execution_event_id,
            decision: Decision::Allow,
            reason: "approved execution".to_string(),
            approval_url: None,
            result,
        }))
    }

    /// Links an execution event to its approved parent.
    ///
    /// Returns `Ok(true)` when this caller created the link, `Ok(false)`
    /// when a concurrent caller won the primary-key race, and an error on
    /// any other storage fault.
    ///
    /// # Errors
    ///
    /// Returns an error on non-constraint storage failures.
    pub fn link_execution_to_parent(
        &self,
        parent_event_id: &str,
        execution_event_id: &str,
        consumed_grant_id: &str,
    ) -> Result<bool, EvidenceError> {
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT INTO tool_executions (
                parent_event_id, execution_event_id, consumed_grant_id, created_at
            ) VALUES (?1, ?2, ?3, ?4)",
            params![parent_event_id, execution_event_id, consumed_grant_id, to_ms(Utc::now())],
        );
        match inserted {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == SQLITE_CONSTRAINT_PRIMARYKEY
                    || e.extended_code == SQLITE_CONSTRAINT_UNIQUE =>
            {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Returns a tenant's events strictly after `after_seq`, in insertion
    /// order, shaped for chain verification and archiving.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or a corrupt row.
    pub fn get_chain_events(
        &self,
        tenant_id: &str,
        after_seq: i64,
    ) -> Result<Vec<ChainEvent>, EvidenceError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT e.event_seq, e.event_id, e.prev_hash, e.hash,
                    e.payload_canon, r.result_canon, e.received_at
             FROM tool_events e
             LEFT JOIN tool_results r ON r.event_id = e.event_id
             WHERE e.tenant_id = ?1 AND e.event_seq > ?2
             ORDER BY e.event_seq ASC",
        )?;
        let rows = stmt.query_map(params![tenant_id, after_seq], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (event_seq, event_id, prev_hash, hash, canon_payload, canon_result, received_at) =
                row?;
            events.push(ChainEvent {
                event_seq,
                event_id,
                prev_hash,
                hash,
                canon_payload,
                canon_result,
                received_at: from_ms(received_at)?,
            });
        }
        Ok(events)
    }

    /// Reads a tenant's archive checkpoint, defaulting to the chain head.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn get_archive_checkpoint(
        &self,
        tenant_id: &str,
    ) -> Result<(DateTime<Utc>, String, i64), EvidenceError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT last_archived_at, last_hash, last_event_seq
                 FROM evidence_archive_checkpoints
                 WHERE tenant_id = ?1",
                params![tenant_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((at, hash, seq)) => Ok((from_ms(at)?, hash, seq)),
            None => Ok((DateTime::UNIX_EPOCH, String::new(), 0)),
        }
    }

    /// Advances a tenant's archive checkpoint. `last_event_seq` only moves
    /// forward; a stale writer cannot rewind it.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn upsert_archive_checkpoint(
        &self,
        tenant_id: &str,
        last_archived_at: DateTime<Utc>,
        last_hash: &str,
        last_event_seq: i64,
    ) -> Result<(), EvidenceError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO evidence_archive_checkpoints (
                tenant_id, last_archived_at, last_hash, last_event_seq, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (tenant_id) DO UPDATE SET
                last_archived_at = excluded.last_archived_at,
                last_hash = excluded.last_hash,
                last_event_seq = excluded.last_event_seq,
                updated_at = excluded.updated_at
            WHERE excluded.last_event_seq >= evidence_archive_checkpoints.last_event_seq",
            params![
                tenant_id,
                to_ms(last_archived_at),
                last_hash,
                last_event_seq,
                to_ms(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Lists every tenant that has recorded at least one event.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn list_tenant_ids(&self) -> Result<Vec<String>, EvidenceError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT DISTINCT tenant_id FROM tool_events ORDER BY tenant_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut tenants = Vec::new();
        for row in rows {
            tenants.push(row?);
        }
        Ok(tenants)
    }

    /// Returns a tenant's configuration options, empty when the tenant has
    /// no row.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or unparsable config.
    pub fn tenant_config(
        &self,
        tenant_id: &str,
    ) -> Result<BTreeMap<String, String>, EvidenceError> {
        let conn = self.conn();
        let config: Option<String> = conn
            .query_row(
                "SELECT config FROM tenants WHERE id = ?1",
                params![tenant_id],
                |row| row.get(0),
            )
            .optional()?;
        match config {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Creates or replaces a tenant row.
    ///
    /// # Errors
    ///
    /// Returns an error on storage or serialization failure.
    pub fn upsert_tenant(
        &self,
        tenant_id: &str,
        name: &str,
        config: &BTreeMap<String, String>,
    ) -> Result<(), EvidenceError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO tenants (id, name, config) VALUES (?1, ?2, ?3)
             ON CONFLICT (id) DO UPDATE SET name = excluded.name, config = excluded.config",
            params![tenant_id, name, serde_json::to_string(config)?],
        )?;
        Ok(())
    }
}

struct EventRow {
    event_seq: i64,
    tenant_id: String,
    agent_id: String,
    tool: String,
    action: String,
    payload_canon: String,
    risk_score: i64,
    decision: String,
    policy_result: Option<String>,
    idempotency_key: String,
    session_id: String,
    user_id: String,
    source_ip: String,
    trace_id: String,
    received_at: i64,
    requested_at: i64,
    hash: String,
    prev_hash: String,
    result_status: Option<String>,
    result_output: Option<String>,
    result_error: Option<String>,
    result_duration_ms: Option<i64>,
}
