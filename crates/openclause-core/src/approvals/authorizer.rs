//! Per-tenant approver allowlists.
//!
//! Two identity channels are recognized: email (the approvals API) and
//! Slack user id (the interaction callback). Membership is required
//! whenever the tenant has an allowlist on that channel; a tenant with no
//! configured allowlist denies everyone. Unknown approvers never pass.

use std::collections::{HashMap, HashSet};

/// Decides whether a given identity may approve or deny for a tenant.
#[derive(Debug, Default)]
pub struct ApproverAuthorizer {
    email_by_tenant: HashMap<String, HashSet<String>>,
    slack_by_tenant: HashMap<String, HashSet<String>>,
}

impl ApproverAuthorizer {
    /// Builds an authorizer from the two allowlist strings, each formatted
    /// `tenant:id1|id2,tenant2:id3`.
    #[must_use]
    pub fn new(email_allowlist: &str, slack_allowlist: &str) -> Self {
        Self {
            email_by_tenant: parse_tenant_list(email_allowlist),
            slack_by_tenant: parse_tenant_list(slack_allowlist),
        }
    }

    /// Whether `email` may decide approvals for `tenant_id`.
    #[must_use]
    pub fn allow_email(&self, tenant_id: &str, email: &str) -> bool {
        allow(&self.email_by_tenant, tenant_id, email)
    }

    /// Whether the Slack user may decide approvals for `tenant_id`.
    #[must_use]
    pub fn allow_slack(&self, tenant_id: &str, user_id: &str) -> bool {
        allow(&self.slack_by_tenant, tenant_id, user_id)
    }
}

fn allow(lists: &HashMap<String, HashSet<String>>, tenant_id: &str, identity: &str) -> bool {
    let identity = identity.trim().to_lowercase();
    if identity.is_empty() {
        return false;
    }
    match lists.get(tenant_id) {
        Some(allowed) if !allowed.is_empty() => allowed.contains(&identity),
        // No allowlist configured for this tenant: deny.
        _ => false,
    }
}

fn parse_tenant_list(raw: &str) -> HashMap<String, HashSet<String>> {
    let mut out: HashMap<String, HashSet<String>> = HashMap::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((tenant, values)) = entry.split_once(':') else {
            continue;
        };
        let tenant = tenant.trim();
        if tenant.is_empty() {
            continue;
        }
        let set = out.entry(tenant.to_string()).or_default();
        for value in values.split('|') {
            let value = value.trim();
            if !value.is_empty() {
                set.insert(value.to_lowercase());
            }
        }
    }
    out
}
