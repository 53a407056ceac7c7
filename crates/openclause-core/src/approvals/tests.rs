//! Tests for the approval store.

use chrono::{Duration, Utc};
use tempfile::TempDir;

use super::*;
use crate::types::NotifyRoute;

fn temp_store() -> (ApprovalStore, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let store = ApprovalStore::open(dir.path().join("approvals.db")).expect("open store");
    (store, dir)
}

fn create_input(tenant: &str) -> CreateApprovalInput {
    CreateApprovalInput {
        event_id: uuid::Uuid::new_v4().to_string(),
        tenant_id: tenant.into(),
        agent_id: "agent-1".into(),
        tool: "slack".into(),
        action: "msg.post".into(),
        resource: "slack://channel/general".into(),
        risk_score: 8,
        risk_factors: vec!["external_message".into()],
        reason: "risk above threshold".into(),
        trace_id: "trace-1".into(),
        approver_group: "sec-ops".into(),
        notify: vec![
            NotifyRoute {
                kind: "webhook".into(),
                url: "https://hooks.example.com/oc".into(),
                secret_ref: "hooks-prod".into(),
                channel: String::new(),
            },
            NotifyRoute {
                kind: "slack".into(),
                url: String::new(),
                secret_ref: String::new(),
                channel: "#approvals".into(),
            },
        ],
        approval_base_url: "https://approvals.example.com".into(),
    }
}

fn expire_request(dir: &TempDir, request_id: &str) {
    let conn = rusqlite::Connection::open(dir.path().join("approvals.db")).expect("raw conn");
    let past = (Utc::now() - Duration::hours(1)).timestamp_millis();
    conn.execute(
        "UPDATE approval_requests SET expires_at = ?2 WHERE id = ?1",
        rusqlite::params![request_id, past],
    )
    .expect("expire");
}

#[test]
fn create_request_inserts_outbox_in_same_transaction() {
    let (store, _dir) = temp_store();

    let request = store.create_request(&create_input("tenant1")).expect("create");
    assert_eq!(request.status, ApprovalStatus::Pending);
    assert!(request.expires_at > request.created_at);

    let notifications = store
        .list_notifications_for_request(&request.id)
        .expect("notifications");
    assert_eq!(notifications.len(), 2);
    assert_eq!(notifications[0].status, OutboxStatus::Pending);
    assert!(notifications[0]
        .approval_url
        .ends_with(&format!("/v1/approvals/requests/{}", request.id)));
    let kinds: Vec<&str> = notifications.iter().map(|n| n.notify_kind.as_str()).collect();
    assert!(kinds.contains(&"webhook") && kinds.contains(&"slack"));
}

#[test]
fn create_request_requires_fields() {
    let (store, _dir) = temp_store();

    let mut input = create_input("tenant1");
    input.tool.clear();
    assert!(matches!(
        store.create_request(&input),
        Err(ApprovalError::MissingField { field: "tool" })
    ));
}

#[test]
fn routes_without_kind_are_skipped() {
    let (store, _dir) = temp_store();

    let mut input = create_input("tenant1");
    input.notify.push(NotifyRoute::default());
    let request = store.create_request(&input).expect("create");
    assert_eq!(
        store.list_notifications_for_request(&request.id).unwrap().len(),
        2
    );
}

#[test]
fn grant_transitions_pending_to_approved_once() {
    let (store, _dir) = temp_store();
    let request = store.create_request(&create_input("tenant1")).expect("create");

    let grant = store
        .grant_request(
            &request.id,
            &GrantInput { approver: "alice@example.com".into(), ..Default::default() },
        )
        .expect("grant");
    assert_eq!(grant.max_uses, 1);
    assert_eq!(grant.uses_left, 1);
    assert_eq!(grant.scope.tool, "slack");
    assert_eq!(grant.scope.resource_pattern, "slack://channel/general");

    let loaded = store.get_request(&request.id).expect("get").expect("found");
    assert_eq!(loaded.status, ApprovalStatus::Approved);

    // Second approver observes not-pending.
    let err = store
        .grant_request(
            &request.id,
            &GrantInput { approver: "bob@example.com".into(), ..Default::default() },
        )
        .unwrap_err();
    assert!(matches!(err, ApprovalError::NotPending { .. }));
}

#[test]
fn grant_honors_overrides() {
    let (store, _dir) = temp_store();
    let request = store.create_request(&create_input("tenant1")).expect("create");

    let grant = store
        .grant_request(
            &request.id,
            &GrantInput {
                approver: "alice@example.com".into(),
                max_uses: 3,
                expires_in_sec: 7200,
                resource_pattern: Some("slack://channel/*".into()),
            },
        )
        .expect("grant");
    assert_eq!(grant.max_uses, 3);
    assert_eq!(grant.scope.resource_pattern, "slack://channel/*");
    assert!(grant.expires_at > Utc::now() + Duration::seconds(7100));
}

#[test]
fn grant_unknown_request_is_not_found() {
    let (store, _dir) = temp_store();
    let err = store
        .grant_request("no-such-id", &GrantInput { approver: "a@b.c".into(), ..Default::default() })
        .unwrap_err();
    assert!(matches!(err, ApprovalError::NotFound { .. }));
}

#[test]
fn grant_expired_request_fails() {
    let (store, dir) = temp_store();
    let request = store.create_request(&create_input("tenant1")).expect("create");
    expire_request(&dir, &request.id);

    let err = store
        .grant_request(
            &request.id,
            &GrantInput { approver: "alice@example.com".into(), ..Default::default() },
        )
        .unwrap_err();
    assert!(matches!(err, ApprovalError::Expired { .. }));
}

#[test]
fn deny_records_denier_and_reason() {
    let (store, _dir) = temp_store();
    let request = store.create_request(&create_input("tenant1")).expect("create");

    store
        .deny_request(
            &request.id,
            &DenyInput { approver: "alice@example.com".into(), reason: "too risky".into() },
        )
        .expect("deny");

    let loaded = store.get_request(&request.id).expect("get").expect("found");
    assert_eq!(loaded.status, ApprovalStatus::Denied);
    assert_eq!(loaded.deny_reason, "too risky");
    assert_eq!(loaded.denied_by, "alice@example.com");

    let err = store
        .deny_request(
            &request.id,
            &DenyInput { approver: "bob@example.com".into(), reason: "again".into() },
        )
        .unwrap_err();
    assert!(matches!(err, ApprovalError::NotPending { .. }));
}

#[test]
fn list_pending_is_tenant_scoped_and_clamped() {
    let (store, _dir) = temp_store();
    for _ in 0..3 {
        store.create_request(&create_input("tenant1")).expect("create");
    }
    store.create_request(&create_input("tenant2")).expect("create");

    let pending = store.list_pending("tenant1", 0, 0).expect("list");
    assert_eq!(pending.len(), 3);
    let pending = store.list_pending("tenant1", 2, 0).expect("list");
    assert_eq!(pending.len(), 2);
    let pending = store.list_pending("tenant1", 100_000, -5).expect("list");
    assert_eq!(pending.len(), 3);
}

fn granted_store() -> (ApprovalStore, ApprovalGrant, TempDir) {
    let (store, dir) = temp_store();
    let request = store.create_request(&create_input("tenant1")).expect("create");
    let grant = store
        .grant_request(
            &request.id,
            &GrantInput { approver: "alice@example.com".into(), ..Default::default() },
        )
        .expect("grant");
    (store, grant, dir)
}

#[test]
fn consume_grant_decrements_and_exhausts() {
    let (store, grant, _dir) = granted_store();

    let consumed = store
        .find_and_consume_grant("tenant1", "agent-1", "slack", "msg.post", "slack://channel/general")
        .expect("consume")
        .expect("grant found");
    assert_eq!(consumed.id, grant.id);
    assert_eq!(consumed.uses_left, 0);

    // Single-use grant is exhausted.
    let second = store
        .find_and_consume_grant("tenant1", "agent-1", "slack", "msg.post", "slack://channel/general")
        .expect("consume");
    assert!(second.is_none());
}

#[test]
fn consume_grant_enforces_scope() {
    let (store, _grant, _dir) = granted_store();

    // Wrong tenant, tool, action, and resource all miss.
    for (tenant, agent, tool, action, resource) in [
        ("tenant2", "agent-1", "slack", "msg.post", "slack://channel/general"),
        ("tenant1", "agent-1", "jira", "msg.post", "slack://channel/general"),
        ("tenant1", "agent-1", "slack", "msg.delete", "slack://channel/general"),
        ("tenant1", "agent-1", "slack", "msg.post", "slack://channel/secops"),
    ] {
        assert!(
            store
                .find_and_consume_grant(tenant, agent, tool, action, resource)
                .expect("consume")
                .is_none(),
            "{tenant}/{tool}/{action}/{resource} should not match"
        );
    }
}

#[test]
fn consume_matches_wildcards_and_patterns() {
    let (store, _dir) = temp_store();
    let request = store.create_request(&create_input("tenant1")).expect("create");
    store
        .grant_request(
            &request.id,
            &GrantInput {
                approver: "alice@example.com".into(),
                max_uses: 5,
                resource_pattern: Some("slack://channel/*".into()),
                ..Default::default()
            },
        )
        .expect("grant");

    let consumed = store
        .find_and_consume_grant("tenant1", "agent-1", "slack", "msg.post", "slack://channel/random")
        .expect("consume");
    assert!(consumed.is_some());
}

#[test]
fn mismatching_newest_grant_does_not_hide_older_one() {
    let (store, _dir) = temp_store();

    let older = store.create_request(&create_input("tenant1")).expect("create");
    store
        .grant_request(
            &older.id,
            &GrantInput { approver: "alice@example.com".into(), ..Default::default() },
        )
        .expect("older grant");

    let newer = store.create_request(&create_input("tenant1")).expect("create");
    store
        .grant_request(
            &newer.id,
            &GrantInput {
                approver: "alice@example.com".into(),
                resource_pattern: Some("jira://*".into()),
                ..Default::default()
            },
        )
        .expect("newer grant");

    // Newest-first scan hits the jira-scoped grant first; the resource
    // check must skip it and land on the older exact-match grant.
    let consumed = store
        .find_and_consume_grant("tenant1", "agent-1", "slack", "msg.post", "slack://channel/general")
        .expect("consume")
        .expect("older grant matched");
    assert_eq!(consumed.request_id, older.id);
}

#[test]
fn single_use_grant_has_exactly_one_winner_under_concurrency() {
    let (store, _grant, _dir) = granted_store();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(std::thread::spawn(move || {
            store
                .find_and_consume_grant(
                    "tenant1",
                    "agent-1",
                    "slack",
                    "msg.post",
                    "slack://channel/general",
                )
                .expect("consume call")
                .is_some()
        }));
    }
    let winners: usize = handles
        .into_iter()
        .map(|h| usize::from(h.join().expect("thread")))
        .sum();
    assert_eq!(winners, 1);
}

#[test]
fn outbox_claim_is_atomic_and_single_shot() {
    let (store, _dir) = temp_store();
    let request = store.create_request(&create_input("tenant1")).expect("create");

    let claimed = store.claim_due_notifications(10).expect("claim");
    assert_eq!(claimed.len(), 2);
    for n in &claimed {
        assert_eq!(n.status, OutboxStatus::Processing);
        assert_eq!(n.attempt_count, 1);
    }

    // Already processing: nothing left to claim.
    assert!(store.claim_due_notifications(10).expect("claim").is_empty());

    let stored = store.list_notifications_for_request(&request.id).expect("list");
    assert!(stored.iter().all(|n| n.status == OutboxStatus::Processing));
}

#[test]
fn outbox_retry_and_terminal_failure() {
    let (store, _dir) = temp_store();
    let mut input = create_input("tenant1");
    input.notify.truncate(1);
    store.create_request(&input).expect("create");

    let claimed = store.claim_due_notifications(1).expect("claim");
    let item = &claimed[0];

    // Retry far in the future: not due again yet.
    store
        .mark_notification_retry(&item.id, item.attempt_count, Utc::now() + Duration::minutes(5), "status=500")
        .expect("retry");
    assert!(store.claim_due_notifications(10).expect("claim").is_empty());
    let stored = store.get_notification(&item.id).expect("get").expect("found");
    assert_eq!(stored.status, OutboxStatus::Pending);
    assert_eq!(stored.last_error, "status=500");

    // Due now: claimable again, attempt count advances.
    store
        .mark_notification_retry(&item.id, item.attempt_count, Utc::now() - Duration::seconds(1), "status=500")
        .expect("retry due");
    let reclaimed = store.claim_due_notifications(10).expect("claim");
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].attempt_count, 2);

    store.mark_notification_failed(&item.id, "max retries exceeded").expect("fail");
    let stored = store.get_notification(&item.id).expect("get").expect("found");
    assert_eq!(stored.status, OutboxStatus::Failed);

    store.mark_notification_sent(&reclaimed[0].id).expect("sent");
}

#[test]
fn outbox_sent_clears_error() {
    let (store, _dir) = temp_store();
    let mut input = create_input("tenant1");
    input.notify.truncate(1);
    store.create_request(&input).expect("create");

    let claimed = store.claim_due_notifications(1).expect("claim");
    store
        .mark_notification_retry(&claimed[0].id, 1, Utc::now() - Duration::seconds(1), "boom")
        .expect("retry");
    let reclaimed = store.claim_due_notifications(1).expect("claim");
    store.mark_notification_sent(&reclaimed[0].id).expect("sent");

    let stored = store.get_notification(&claimed[0].id).expect("get").expect("found");
    assert_eq!(stored.status, OutboxStatus::Sent);
    assert_eq!(stored.last_error, "");
}
