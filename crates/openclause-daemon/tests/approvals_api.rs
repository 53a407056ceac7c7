//! Approvals service API tests: internal auth, the approve/deny
//! lifecycle over HTTP, and the signed Slack interaction callback.

mod common;

use chrono::Utc;
use common::{spawn_env, toolcall_body, INTERNAL_TOKEN, SLACK_SIGNING_SECRET, TENANT1_KEY};
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use sha2::Sha256;

async fn pending_request(env: &common::TestEnv) -> (String, String) {
    let (_, submitted) = env.submit(TENANT1_KEY, &toolcall_body(8, &uuid())).await;
    assert_eq!(submitted["decision"], "approve");
    let event_id = submitted["event_id"].as_str().expect("event_id").to_string();
    (env.request_id_from(&submitted), event_id)
}

fn uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[tokio::test]
async fn internal_routes_require_token() {
    let env = spawn_env().await;
    let (request_id, _) = pending_request(&env).await;

    // Missing token.
    let resp = env
        .client
        .get(format!("{}/v1/approvals/requests/{request_id}", env.approvals_url))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // Wrong token.
    let resp = env
        .client
        .get(format!("{}/v1/approvals/requests/{request_id}", env.approvals_url))
        .header("X-Internal-Token", "wrong")
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // Correct token.
    let resp = env
        .client
        .get(format!("{}/v1/approvals/requests/{request_id}", env.approvals_url))
        .header("X-Internal-Token", INTERNAL_TOKEN)
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), StatusCode::OK);
    let body: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(body["status"], "pending");
}

#[tokio::test]
async fn list_pending_is_tenant_scoped() {
    let env = spawn_env().await;
    let (request_id, _) = pending_request(&env).await;

    let resp = env
        .client
        .get(format!("{}/v1/approvals/pending?tenant_id=tenant1", env.approvals_url))
        .header("X-Internal-Token", INTERNAL_TOKEN)
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), StatusCode::OK);
    let body: serde_json::Value = resp.json().await.expect("json");
    let ids: Vec<&str> =
        body.as_array().expect("array").iter().filter_map(|r| r["id"].as_str()).collect();
    assert!(ids.contains(&request_id.as_str()));

    let resp = env
        .client
        .get(format!("{}/v1/approvals/pending?tenant_id=tenant2", env.approvals_url))
        .header("X-Internal-Token", INTERNAL_TOKEN)
        .send()
        .await
        .expect("request");
    let body: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(body.as_array().expect("array").len(), 0);

    // tenant_id is required.
    let resp = env
        .client
        .get(format!("{}/v1/approvals/pending", env.approvals_url))
        .header("X-Internal-Token", INTERNAL_TOKEN)
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn approver_allowlist_is_enforced() {
    let env = spawn_env().await;
    let (request_id, _) = pending_request(&env).await;

    // mallory is not on tenant1's allowlist.
    let (status, body) = env
        .approve(&request_id, &serde_json::json!({"approver": "mallory@example.com"}))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "FORBIDDEN");

    // alice is.
    let (status, grant) = env
        .approve(&request_id, &serde_json::json!({"approver": "alice@example.com"}))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(grant["approver"], "alice@example.com");
    assert_eq!(grant["scope"]["tool"], "slack");

    // A second approve observes not-pending.
    let (status, body) = env
        .approve(&request_id, &serde_json::json!({"approver": "alice@example.com"}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");
}

#[tokio::test]
async fn deny_over_http_records_denier() {
    let env = spawn_env().await;
    let (request_id, _) = pending_request(&env).await;

    let resp = env
        .client
        .post(format!("{}/v1/approvals/requests/{request_id}/deny", env.approvals_url))
        .header("X-Internal-Token", INTERNAL_TOKEN)
        .json(&serde_json::json!({"approver": "alice@example.com", "reason": "too risky"}))
        .send()
        .await
        .expect("deny");
    assert_eq!(resp.status(), StatusCode::OK);
    let body: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(body["status"], "denied");

    let request = env.approvals.get_request(&request_id).expect("get").expect("found");
    assert_eq!(request.deny_reason, "too risky");
    assert_eq!(request.denied_by, "alice@example.com");
}

fn slack_interaction_body(decision: &str, request_id: &str, event_id: &str, user_id: &str) -> String {
    let payload = serde_json::json!({
        "type": "block_actions",
        "user": {"id": user_id, "username": "approver", "name": "Approver"},
        "actions": [{"value": format!("{decision}|{request_id}|{event_id}|tenant1")}],
    });
    serde_urlencoded::to_string([("payload", payload.to_string())]).expect("form encode")
}

fn slack_sign(body: &str, timestamp: i64, secret: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(format!("v0:{timestamp}:{body}").as_bytes());
    format!("v0={}", hex::encode(mac.finalize().into_bytes()))
}

async fn post_interaction(
    env: &common::TestEnv,
    body: String,
    timestamp: i64,
    signature: String,
) -> (StatusCode, serde_json::Value) {
    let resp = env
        .client
        .post(format!("{}/v1/integrations/slack/interactions", env.approvals_url))
        .header("Content-Type", "application/x-www-form-urlencoded")
        .header("X-Slack-Signature", signature)
        .header("X-Slack-Request-Timestamp", timestamp.to_string())
        .body(body)
        .send()
        .await
        .expect("interaction");
    let status = resp.status();
    let body = resp.json().await.unwrap_or(serde_json::Value::Null);
    (status, body)
}

#[tokio::test]
async fn slack_interaction_approves_request() {
    let env = spawn_env().await;
    let (request_id, event_id) = pending_request(&env).await;

    let body = slack_interaction_body("approve", &request_id, &event_id, "U111");
    let ts = Utc::now().timestamp();
    let signature = slack_sign(&body, ts, SLACK_SIGNING_SECRET);

    let (status, reply) = post_interaction(&env, body, ts, signature).await;
    assert_eq!(status, StatusCode::OK, "{reply}");
    assert_eq!(reply["replace_original"], true);
    assert!(reply["text"].as_str().unwrap().starts_with("Approved by @"));

    let request = env.approvals.get_request(&request_id).expect("get").expect("found");
    assert_eq!(request.status, openclause_core::approvals::ApprovalStatus::Approved);

    // The grant is scoped and single-use.
    let grant = env
        .approvals
        .find_and_consume_grant("tenant1", "agent-1", "slack", "msg.post", "slack://channel/general")
        .expect("consume")
        .expect("grant exists");
    assert_eq!(grant.approver, "slack:U111");
    assert_eq!(grant.uses_left, 0);
}

#[tokio::test]
async fn slack_interaction_denies_request() {
    let env = spawn_env().await;
    let (request_id, event_id) = pending_request(&env).await;

    let body = slack_interaction_body("deny", &request_id, &event_id, "U111");
    let ts = Utc::now().timestamp();
    let signature = slack_sign(&body, ts, SLACK_SIGNING_SECRET);

    let (status, reply) = post_interaction(&env, body, ts, signature).await;
    assert_eq!(status, StatusCode::OK);
    assert!(reply["text"].as_str().unwrap().starts_with("Denied by @"));

    let request = env.approvals.get_request(&request_id).expect("get").expect("found");
    assert_eq!(request.status, openclause_core::approvals::ApprovalStatus::Denied);
    assert_eq!(request.denied_by, "slack:U111");
}

#[tokio::test]
async fn slack_interaction_rejects_bad_auth() {
    let env = spawn_env().await;
    let (request_id, event_id) = pending_request(&env).await;
    let ts = Utc::now().timestamp();

    // Tampered signature.
    let body = slack_interaction_body("approve", &request_id, &event_id, "U111");
    let (status, _) = post_interaction(&env, body.clone(), ts, "v0=deadbeef".into()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Signature computed with the wrong secret.
    let bad_signature = slack_sign(&body, ts, "some-other-secret");
    let (status, _) = post_interaction(&env, body.clone(), ts, bad_signature).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Stale timestamp.
    let stale = ts - 6 * 60;
    let stale_signature = slack_sign(&body, stale, SLACK_SIGNING_SECRET);
    let (status, _) = post_interaction(&env, body, stale, stale_signature).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Valid signature, but the Slack user is not on the allowlist.
    let body = slack_interaction_body("approve", &request_id, &event_id, "U999");
    let signature = slack_sign(&body, ts, SLACK_SIGNING_SECRET);
    let (status, _) = post_interaction(&env, body, ts, signature).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Event-id mismatch in the action value.
    let body = slack_interaction_body("approve", &request_id, &uuid(), "U111");
    let signature = slack_sign(&body, ts, SLACK_SIGNING_SECRET);
    let (status, _) = post_interaction(&env, body, ts, signature).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Nothing got approved along the way.
    let request = env.approvals.get_request(&request_id).expect("get").expect("found");
    assert_eq!(request.status, openclause_core::approvals::ApprovalStatus::Pending);
}
