//! Tenant API keys and service-to-service auth.
//!
//! API keys are configured as comma-separated `tenant:key` pairs and held
//! in memory only as SHA-256 hashes, so a memory dump never yields usable
//! credentials. Lookup hashes the presented key. The internal token used
//! between services is compared in constant time.

use std::collections::HashMap;

use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Maps hashed API keys to tenant ids.
#[derive(Debug, Default)]
pub struct ApiKeyStore {
    // SHA-256(key) hex → tenant id
    keys: HashMap<String, String>,
}

impl ApiKeyStore {
    /// Parses a comma-separated `tenant:key` string, e.g.
    /// `tenant1:sk-abc,tenant2:sk-def`. Malformed entries are skipped.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let mut keys = HashMap::new();
        for pair in raw.split(',') {
            let Some((tenant, key)) = pair.trim().split_once(':') else {
                continue;
            };
            let tenant = tenant.trim();
            let key = key.trim();
            if !tenant.is_empty() && !key.is_empty() {
                keys.insert(hash_key(key), tenant.to_string());
            }
        }
        Self { keys }
    }

    /// Returns the tenant that owns the presented API key.
    #[must_use]
    pub fn lookup(&self, api_key: &str) -> Option<&str> {
        self.keys.get(&hash_key(api_key)).map(String::as_str)
    }

    /// Whether any keys are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Constant-time check of a presented internal token against the
/// configured one. An unconfigured token disables the check, matching the
/// single-trust-zone deployment mode.
#[must_use]
pub fn verify_internal_token(expected: Option<&SecretString>, presented: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    let Some(presented) = presented else {
        return false;
    };
    expected
        .expose_secret()
        .as_bytes()
        .ct_eq(presented.as_bytes())
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_resolves_tenant_by_key() {
        let store = ApiKeyStore::parse("tenant1:sk-abc, tenant2:sk-def");
        assert_eq!(store.lookup("sk-abc"), Some("tenant1"));
        assert_eq!(store.lookup("sk-def"), Some("tenant2"));
        assert_eq!(store.lookup("sk-wrong"), None);
        assert_eq!(store.lookup(""), None);
    }

    #[test]
    fn parse_skips_malformed_entries() {
        let store = ApiKeyStore::parse("nocolon,:nokey,tenant3:,tenant1:sk-abc");
        assert_eq!(store.lookup("sk-abc"), Some("tenant1"));
        assert_eq!(store.lookup("nocolon"), None);
    }

    #[test]
    fn empty_spec_yields_empty_store() {
        assert!(ApiKeyStore::parse("").is_empty());
    }

    #[test]
    fn internal_token_comparison() {
        let expected = SecretString::from("internal-secret");
        assert!(verify_internal_token(Some(&expected), Some("internal-secret")));
        assert!(!verify_internal_token(Some(&expected), Some("internal-secreT")));
        assert!(!verify_internal_token(Some(&expected), Some("short")));
        assert!(!verify_internal_token(Some(&expected), None));
        // Unconfigured: check disabled.
        assert!(verify_internal_token(None, None));
        assert!(verify_internal_token(None, Some("anything")));
    }
}
