//! SQLite-backed approval storage.
//!
//! State transitions are guarded conditional UPDATEs whose rows-affected
//! count is checked inside the transaction, so a second concurrent
//! approver observes not-pending instead of double-approving. Grant
//! consumption and the `uses_left` decrement commit atomically.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use thiserror::Error;
use uuid::Uuid;

use super::glob::match_resource;
use super::{
    ApprovalGrant, ApprovalRequest, ApprovalScope, ApprovalStatus, CreateApprovalInput, DenyInput,
    GrantInput, NotificationOutbox, OutboxStatus,
};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// How long a new approval request stays decidable.
const REQUEST_TTL_HOURS: i64 = 24;

/// Default grant lifetime when the approver does not specify one.
const GRANT_TTL_SECS: i64 = 3600;

/// Server-enforced page-size cap for pending listings.
const MAX_PENDING_LIMIT: i64 = 200;

/// Default outbox claim batch size.
const DEFAULT_CLAIM_LIMIT: i64 = 100;

/// Errors that can occur during approval operations.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A required input field was empty.
    #[error("{field} is required")]
    MissingField {
        /// The empty field.
        field: &'static str,
    },

    /// No approval request with the given id.
    #[error("approval request {id} not found")]
    NotFound {
        /// The missing id.
        id: String,
    },

    /// The request was already decided.
    #[error("approval request {id} is {status}, not pending")]
    NotPending {
        /// The request id.
        id: String,
        /// Its current status.
        status: String,
    },

    /// The request passed its deadline undecided.
    #[error("approval request {id} expired")]
    Expired {
        /// The request id.
        id: String,
    },

    /// A stored row contradicts the schema's invariants.
    #[error("corrupt approval row: {0}")]
    Corrupt(String),
}

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>, ApprovalError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| ApprovalError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn parse_status(s: &str) -> Result<ApprovalStatus, ApprovalError> {
    match s {
        "pending" => Ok(ApprovalStatus::Pending),
        "approved" => Ok(ApprovalStatus::Approved),
        "denied" => Ok(ApprovalStatus::Denied),
        "expired" => Ok(ApprovalStatus::Expired),
        other => Err(ApprovalError::Corrupt(format!("unknown status {other:?}"))),
    }
}

fn parse_outbox_status(s: &str) -> Result<OutboxStatus, ApprovalError> {
    match s {
        "pending" => Ok(OutboxStatus::Pending),
        "processing" => Ok(OutboxStatus::Processing),
        "sent" => Ok(OutboxStatus::Sent),
        "failed" => Ok(OutboxStatus::Failed),
        other => Err(ApprovalError::Corrupt(format!("unknown outbox status {other:?}"))),
    }
}

/// Builds the human approval link for a request.
#[must_use]
pub fn build_approval_url(base_url: &str, request_id: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = if base.is_empty() { "http://localhost:8081" } else { base };
    format!("{base}/v1/approvals/requests/{request_id}")
}

/// Manages approval requests, grants, and the notification outbox.
///
/// Cloning is cheap; all clones share one connection.
#[derive(Clone)]
pub struct ApprovalStore {
    conn: Arc<Mutex<Connection>>,
}

impl ApprovalStore {
    /// Opens (or creates) the approval store at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ApprovalError> {
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
    pub fn in_memory() -> Result<Self, ApprovalError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("approval store mutex poisoned")
    }

    /// Inserts a pending approval request together with one outbox row per
    /// notification route, in a single transaction.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::MissingField`] when required inputs are
    /// empty, or a storage error (nothing is persisted).
    pub fn create_request(
        &self,
        input: &CreateApprovalInput,
    ) -> Result<ApprovalRequest, ApprovalError> {
        for (field, value) in [
            ("tenant_id", &input.tenant_id),
            ("event_id", &input.event_id),
            ("tool", &input.tool),
            ("action", &input.action),
        ] {
            if value.is_empty() {
                return Err(ApprovalError::MissingField { field });
            }
        }

        let now = Utc::now();
        let request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            event_id: input.event_id.clone(),
            tenant_id: input.tenant_id.clone(),
            agent_id: input.agent_id.clone(),
            tool: input.tool.clone(),
            action: input.action.clone(),
            resource: input.resource.clone(),
            risk_score: input.risk_score,
            reason: input.reason.clone(),
            deny_reason: String::new(),
            denied_by: String::new(),
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now + Duration::hours(REQUEST_TTL_HOURS),
        };

        let risk_factors = serde_json::to_string(&input.risk_factors)?;
        let approval_url = build_approval_url(&input.approval_base_url, &request.id);

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO approval_requests (
                id, event_id, tenant_id, agent_id, tool, action, resource,
                risk_score, reason, status, created_at, updated_at, expires_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                request.id,
                request.event_id,
                request.tenant_id,
                request.agent_id,
                request.tool,
                request.action,
                request.resource,
                request.risk_score,
                request.reason,
                request.status.as_str(),
                to_ms(request.created_at),
                to_ms(now),
                to_ms(request.expires_at),
            ],
        )?;

        for route in &input.notify {
            if route.kind.is_empty() {
                continue;
            }
            tx.execute(
                "INSERT INTO approval_notification_outbox (
                    id, approval_request_id, tenant_id, event_id, trace_id,
                    tool, action, resource, risk_score, risk_factors, reason,
                    approver_group, approval_url,
                    notify_kind, notify_url, secret_ref, slack_channel,
                    status, attempt_count, next_attempt_at, created_at, updated_at
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5,
                    ?6, ?7, ?8, ?9, ?10, ?11,
                    ?12, ?13,
                    ?14, ?15, ?16, ?17,
                    'pending', 0, ?18, ?18, ?18
                )",
                params![
                    Uuid::new_v4().to_string(),
                    request.id,
                    request.tenant_id,
                    request.event_id,
                    input.trace_id,
                    request.tool,
                    request.action,
                    request.resource,
                    request.risk_score,
                    risk_factors,
                    request.reason,
                    input.approver_group,
                    approval_url,
                    route.kind.to_lowercase(),
                    route.url,
                    route.secret_ref,
                    route.channel,
                    to_ms(now),
                ],
            )?;
        }

        tx.commit()?;
        Ok(request)
    }

    /// Fetches a single approval request.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn get_request(&self, id: &str) -> Result<Option<ApprovalRequest>, ApprovalError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, event_id, tenant_id, agent_id, tool, action, resource,
                        risk_score, reason, deny_reason, denied_by, status,
                        created_at, expires_at
                 FROM approval_requests WHERE id = ?1",
                params![id],
                map_request_row,
            )
            .optional()?;
        row.map(finish_request_row).transpose()
    }

    /// Lists a tenant's pending, unexpired requests, newest first.
    ///
    /// `limit` is clamped to the server cap; negative offsets collapse
    /// to zero.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn list_pending(
        &self,
        tenant_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        let limit = if limit <= 0 || limit > MAX_PENDING_LIMIT { MAX_PENDING_LIMIT } else { limit };
        let offset = offset.max(0);

        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, event_id, tenant_id, agent_id, tool, action, resource,
                    risk_score, reason, deny_reason, denied_by, status,
                    created_at, expires_at
             FROM approval_requests
             WHERE tenant_id = ?1 AND status = 'pending' AND expires_at > ?2
             ORDER BY created_at DESC
             LIMIT ?3 OFFSET ?4",
        )?;
        let rows = stmt.query_map(params![tenant_id, to_ms(Utc::now()), limit, offset], |row| {
            map_request_row(row)
        })?;
        let mut requests = Vec::new();
        for row in rows {
            requests.push(finish_request_row(row?)?);
        }
        Ok(requests)
    }

    /// Approves a pending request, minting a grant in the same
    /// transaction.
    ///
    /// The status transition is a conditional UPDATE; when it affects no
    /// row, the failure is diagnosed as not-found, expired, or
    /// not-pending.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::NotFound`], [`ApprovalError::Expired`],
    /// [`ApprovalError::NotPending`], or a storage error.
    pub fn grant_request(
        &self,
        request_id: &str,
        input: &GrantInput,
    ) -> Result<ApprovalGrant, ApprovalError> {
        if input.approver.is_empty() {
            return Err(ApprovalError::MissingField { field: "approver" });
        }

        let now = Utc::now();
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let updated = tx.execute(
            "UPDATE approval_requests SET status = 'approved', updated_at = ?2
             WHERE id = ?1 AND status = 'pending' AND expires_at > ?2",
            params![request_id, to_ms(now)],
        )?;
        if updated == 0 {
            return Err(diagnose_transition_failure(&tx, request_id, now)?);
        }

        let (tenant_id, agent_id, tool, action, resource) = tx.query_row(
            "SELECT tenant_id, agent_id, tool, action, resource
             FROM approval_requests WHERE id = ?1",
            params![request_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )?;

        let max_uses = input.max_uses.max(1);
        let ttl = if input.expires_in_sec > 0 { input.expires_in_sec } else { GRANT_TTL_SECS };
        let resource_pattern = match &input.resource_pattern {
            Some(pattern) if !pattern.is_empty() => pattern.clone(),
            _ => resource,
        };

        let grant = ApprovalGrant {
            id: Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            tenant_id: tenant_id.clone(),
            approver: input.approver.clone(),
            scope: ApprovalScope {
                tool,
                action,
                resource_pattern,
                tenant_id,
                agent_id,
            },
            max_uses,
            uses_left: max_uses,
            expires_at: now + Duration::seconds(ttl),
            granted_at: now,
        };

        tx.execute(
            "INSERT INTO approval_grants (
                id, request_id, tenant_id, approver,
                scope_tool, scope_action, scope_resource_pattern,
                scope_tenant_id, scope_agent_id,
                max_uses, uses_left, expires_at, granted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                grant.id,
                grant.request_id,
                grant.tenant_id,
                grant.approver,
                grant.scope.tool,
                grant.scope.action,
                grant.scope.resource_pattern,
                grant.scope.tenant_id,
                grant.scope.agent_id,
                grant.max_uses,
                grant.uses_left,
                to_ms(grant.expires_at),
                to_ms(grant.granted_at),
            ],
        )?;

        tx.commit()?;
        Ok(grant)
    }

    /// Denies a pending request, recording the denier and rationale.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::NotFound`], [`ApprovalError::NotPending`], or a
    /// storage error.
    pub fn deny_request(&self, request_id: &str, input: &DenyInput) -> Result<(), ApprovalError> {
        if input.approver.is_empty() {
            return Err(ApprovalError::MissingField { field: "approver" });
        }
        let now = Utc::now();
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE approval_requests
             SET status = 'denied', deny_reason = ?2, denied_by = ?3, updated_at = ?4
             WHERE id = ?1 AND status = 'pending'",
            params![request_id, input.reason, input.approver, to_ms(now)],
        )?;
        if updated == 0 {
            let status: Option<String> = conn
                .query_row(
                    "SELECT status FROM approval_requests WHERE id = ?1",
                    params![request_id],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match status {
                None => ApprovalError::NotFound { id: request_id.to_string() },
                Some(status) => ApprovalError::NotPending { id: request_id.to_string(), status },
            });
        }
        Ok(())
    }

    /// Finds a valid grant matching the scope and atomically consumes one
    /// use. Candidates are scanned newest-first; the resource pattern is
    /// matched in-process so a mismatching newest grant does not hide an
    /// older valid one.
    ///
    /// Returns `None` when no candidate matches.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn find_and_consume_grant(
        &self,
        tenant_id: &str,
        agent_id: &str,
        tool: &str,
        action: &str,
        resource: &str,
    ) -> Result<Option<ApprovalGrant>, ApprovalError> {
        let now = Utc::now();
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidates = {
            let mut stmt = tx.prepare(
                "SELECT id, request_id, tenant_id, approver,
                        scope_tool, scope_action, scope_resource_pattern,
                        scope_tenant_id, scope_agent_id,
                        max_uses, uses_left, expires_at, granted_at
                 FROM approval_grants
                 WHERE tenant_id = ?1
                   AND uses_left > 0
                   AND expires_at > ?2
                   AND (scope_tool = ?3 OR scope_tool = '*')
                   AND (scope_action = ?4 OR scope_action = '*')
                   AND (scope_agent_id = '' OR scope_agent_id = ?5)
                 ORDER BY granted_at DESC",
            )?;
            let rows = stmt.query_map(
                params![tenant_id, to_ms(now), tool, action, agent_id],
                map_grant_row,
            )?;
            let mut candidates = Vec::new();
            for row in rows {
                candidates.push(finish_grant_row(row?)?);
            }
            candidates
        };

        for mut grant in candidates {
            if !match_resource(&grant.scope.resource_pattern, resource) {
                continue;
            }
            let updated = tx.execute(
                "UPDATE approval_grants SET uses_left = uses_left - 1
                 WHERE id = ?1 AND uses_left > 0",
                params![grant.id],
            )?;
            if updated == 0 {
                continue;
            }
            tx.commit()?;
            grant.uses_left -= 1;
            return Ok(Some(grant));
        }
        Ok(None)
    }

    /// Atomically claims due outbox rows for delivery: flips them to
    /// `processing` and increments `attempt_count` in one statement, so
    /// concurrent dispatchers never claim the same row twice.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn claim_due_notifications(
        &self,
        limit: i64,
    ) -> Result<Vec<NotificationOutbox>, ApprovalError> {
        let limit = if limit <= 0 { DEFAULT_CLAIM_LIMIT } else { limit };
        let now = to_ms(Utc::now());
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "UPDATE approval_notification_outbox
             SET status = 'processing', attempt_count = attempt_count + 1, updated_at = ?1
             WHERE id IN (
                 SELECT id FROM approval_notification_outbox
                 WHERE status = 'pending' AND next_attempt_at <= ?1
                 ORDER BY created_at ASC
                 LIMIT ?2
             )
             RETURNING id, approval_request_id, tenant_id, event_id, trace_id,
                       tool, action, resource, risk_score, risk_factors, reason,
                       approver_group, approval_url,
                       notify_kind, notify_url, secret_ref, slack_channel,
                       status, attempt_count, next_attempt_at, last_error, created_at",
        )?;
        let rows = stmt.query_map(params![now, limit], map_outbox_row)?;
        let mut claimed = Vec::new();
        for row in rows {
            claimed.push(finish_outbox_row(row?)?);
        }
        // RETURNING order is not defined; deliver oldest first.
        claimed.sort_by_key(|n| n.created_at);
        Ok(claimed)
    }

    /// Marks an outbox row delivered.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn mark_notification_sent(&self, id: &str) -> Result<(), ApprovalError> {
        let now = to_ms(Utc::now());
        self.conn().execute(
            "UPDATE approval_notification_outbox
             SET status = 'sent', sent_at = ?2, updated_at = ?2, last_error = ''
             WHERE id = ?1",
            params![id, now],
        )?;
        Ok(())
    }

    /// Schedules another delivery attempt with backoff.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn mark_notification_retry(
        &self,
        id: &str,
        attempt_count: i64,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), ApprovalError> {
        self.conn().execute(
            "UPDATE approval_notification_outbox
             SET status = 'pending', attempt_count = ?2, next_attempt_at = ?3,
                 last_error = ?4, updated_at = ?5
             WHERE id = ?1",
            params![id, attempt_count, to_ms(next_attempt_at), last_error, to_ms(Utc::now())],
        )?;
        Ok(())
    }

    /// Marks an outbox row terminally failed.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn mark_notification_failed(&self, id: &str, last_error: &str) -> Result<(), ApprovalError> {
        self.conn().execute(
            "UPDATE approval_notification_outbox
             SET status = 'failed', last_error = ?2, updated_at = ?3
             WHERE id = ?1",
            params![id, last_error, to_ms(Utc::now())],
        )?;
        Ok(())
    }

    /// Reads one outbox row by id.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn get_notification(&self, id: &str) -> Result<Option<NotificationOutbox>, ApprovalError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, approval_request_id, tenant_id, event_id, trace_id,
                        tool, action, resource, risk_score, risk_factors, reason,
                        approver_group, approval_url,
                        notify_kind, notify_url, secret_ref, slack_channel,
                        status, attempt_count, next_attempt_at, last_error, created_at
                 FROM approval_notification_outbox WHERE id = ?1",
                params![id],
                map_outbox_row,
            )
            .optional()?;
        row.map(finish_outbox_row).transpose()
    }

    /// Lists outbox rows for an approval request, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn list_notifications_for_request(
        &self,
        approval_request_id: &str,
    ) -> Result<Vec<NotificationOutbox>, ApprovalError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, approval_request_id, tenant_id, event_id, trace_id,
                    tool, action, resource, risk_score, risk_factors, reason,
                    approver_group, approval_url,
                    notify_kind, notify_url, secret_ref, slack_channel,
                    status, attempt_count, next_attempt_at, last_error, created_at
             FROM approval_notification_outbox
             WHERE approval_request_id = ?1
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![approval_request_id], map_outbox_row)?;
        let mut notifications = Vec::new();
        for row in rows {
            notifications.push(finish_outbox_row(row?)?);
        }
        Ok(notifications)
    }
}

fn diagnose_transition_failure(
    tx: &rusqlite::Transaction<'_>,
    request_id: &str,
    now: DateTime<Utc>,
) -> Result<ApprovalError, ApprovalError> {
    let row: Option<(String, i64)> = tx
        .query_row(
            "SELECT status, expires_at FROM approval_requests WHERE id = ?1",
            params![request_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(match row {
        None => ApprovalError::NotFound { id: request_id.to_string() },
        Some((status, expires_at)) if status == "pending" && expires_at <= to_ms(now) => {
            ApprovalError::Expired { id: request_id.to_string() }
        }
        Some((status, _)) => ApprovalError::NotPending { id: request_id.to_string(), status },
    })
}

struct RequestRow {
    id: String,
    event_id: String,
    tenant_id: String,
    agent_id: String,
    tool: String,
    action: String,
    resource: String,
    risk_score: i64,
    reason: String,
    deny_reason: String,
    denied_by: String,
    status: String,
    created_at: i64,
    expires_at: i64,
}

fn map_request_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestRow> {
    Ok(RequestRow {
        id: row.get(0)?,
        event_id: row.get(1)?,
        tenant_id: row.get(2)?,
        agent_id: row.get(3)?,
        tool: row.get(4)?,
        action: row.get(5)?,
        resource: row.get(6)?,
        risk_score: row.get(7)?,
        reason: row.get(8)?,
        deny_reason: row.get(9)?,
        denied_by: row.get(10)?,
        status: row.get(11)?,
        created_at: row.get(12)?,
        expires_at: row.get(13)?,
    })
}

fn finish_request_row(row: RequestRow) -> Result<ApprovalRequest, ApprovalError> {
    Ok(ApprovalRequest {
        status: parse_status(&row.status)?,
        created_at: from_ms(row.created_at)?,
        expires_at: from_ms(row.expires_at)?,
        id: row.id,
        event_id: row.event_id,
        tenant_id: row.tenant_id,
        agent_id: row.agent_id,
        tool: row.tool,
        action: row.action,
        resource: row.resource,
        risk_score: row.risk_score,
        reason: row.reason,
        deny_reason: row.deny_reason,
        denied_by: row.denied_by,
    })
}

struct GrantRow {
    id: String,
    request_id: String,
    tenant_id: String,
    approver: String,
    scope_tool: String,
    scope_action: String,
    scope_resource_pattern: String,
    scope_tenant_id: String,
    scope_agent_id: String,
    max_uses: i64,
    uses_left: i64,
    expires_at: i64,
    granted_at: i64,
}

fn map_grant_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GrantRow> {
    Ok(GrantRow {
        id: row.get(0)?,
        request_id: row.get(1)?,
        tenant_id: row.get(2)?,
        approver: row.get(3)?,
        scope_tool: row.get(4)?,
        scope_action: row.get(5)?,
        scope_resource_pattern: row.get(6)?,
        scope_tenant_id: row.get(7)?,
        scope_agent_id: row.get(8)?,
        max_uses: row.get(9)?,
        uses_left: row.get(10)?,
        expires_at: row.get(11)?,
        granted_at: row.get(12)?,
    })
}

fn finish_grant_row(row: GrantRow) -> Result<ApprovalGrant, ApprovalError> {
    Ok(ApprovalGrant {
        expires_at: from_ms(row.expires_at)?,
        granted_at: from_ms(row.granted_at)?,
        id: row.id,
        request_id: row.request_id,
        tenant_id: row.tenant_id,
        approver: row.approver,
        scope: ApprovalScope {
            tool: row.scope_tool,
            action: row.scope_action,
            resource_pattern: row.scope_resource_pattern,
            tenant_id: row.scope_tenant_id,
            agent_id: row.scope_agent_id,
        },
        max_uses: row.max_uses,
        uses_left: row.uses_left,
    })
}

struct OutboxRow {
    id: String,
    approval_request_id: String,
    tenant_id: String,
    event_id: String,
    trace_id: String,
    tool: String,
    action: String,
    resource: String,
    risk_score: i64,
    risk_factors: String,
    reason: String,
    approver_group: String,
    approval_url: String,
    notify_kind: String,
    notify_url: String,
    secret_ref: String,
    slack_channel: String,
    status: String,
    attempt_count: i64,
    next_attempt_at: i64,
    last_error: String,
    created_at: i64,
}

fn map_outbox_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxRow> {
    Ok(OutboxRow {
        id: row.get(0)?,
        approval_request_id: row.get(1)?,
        tenant_id: row.get(2)?,
        event_id: row.get(3)?,
        trace_id: row.get(4)?,
        tool: row.get(5)?,
        action: row.get(6)?,
        resource: row.get(7)?,
        risk_score: row.get(8)?,
        risk_factors: row.get(9)?,
        reason: row.get(10)?,
        approver_group: row.get(11)?,
        approval_url: row.get(12)?,
        notify_kind: row.get(13)?,
        notify_url: row.get(14)?,
        secret_ref: row.get(15)?,
        slack_channel: row.get(16)?,
        status: row.get(17)?,
        attempt_count: row.get(18)?,
        next_attempt_at: row.get(19)?,
        last_error: row.get(20)?,
        created_at: row.get(21)?,
    })
}

fn finish_outbox_row(row: OutboxRow) -> Result<NotificationOutbox, ApprovalError> {
    Ok(NotificationOutbox {
        status: parse_outbox_status(&row.status)?,
        next_attempt_at: from_ms(row.next_attempt_at)?,
        created_at: from_ms(row.created_at)?,
        risk_factors: serde_json::from_str(&row.risk_factors)?,
        id: row.id,
        approval_request_id: row.approval_request_id,
        tenant_id: row.tenant_id,
        event_id: row.event_id,
        trace_id: row.trace_id,
        tool: row.tool,
        action: row.action,
        resource: row.resource,
        risk_score: row.risk_score,
        reason: row.reason,
        approver_group: row.approver_group,
        approval_url: row.approval_url,
        notify_kind: row.notify_kind,
        notify_url: row.notify_url,
        secret_ref: row.secret_ref,
        slack_channel: row.slack_channel,
        attempt_count: row.attempt_count,
        last_error: row.last_error,
    })
}
