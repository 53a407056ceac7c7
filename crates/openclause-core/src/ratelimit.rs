//! Per-tenant token-bucket rate limiting.
//!
//! Each tenant gets a bucket with capacity `2 × rate` refilled at `rate`
//! tokens per second, refreshed lazily on access. The bucket map is
//! bounded: when a new tenant would exceed the cap, the least-recently
//! touched tenant's bucket is evicted, so an attacker minting tenant ids
//! cannot grow memory without bound.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Upper bound on tracked tenants.
const MAX_TRACKED_TENANTS: usize = 10_000;

struct Bucket {
    tokens: f64,
    refreshed: Instant,
}

struct Inner {
    buckets: HashMap<String, Bucket>,
    // LRU order: least-recently touched tenant at the front.
    order: Vec<String>,
}

/// A bounded map of per-tenant token buckets.
pub struct TenantRateLimiter {
    rate: f64,
    capacity: f64,
    max_tracked: usize,
    inner: Mutex<Inner>,
}

impl TenantRateLimiter {
    /// Creates a limiter allowing `rate` requests per second per tenant,
    /// with burst capacity `2 × rate`.
    #[must_use]
    pub fn new(rate: u64) -> Self {
        Self::with_max_tracked(rate, MAX_TRACKED_TENANTS)
    }

    /// Like [`Self::new`] with an explicit tracked-tenant bound.
    #[must_use]
    pub fn with_max_tracked(rate: u64, max_tracked: usize) -> Self {
        let rate = rate.max(1) as f64;
        Self {
            rate,
            capacity: rate * 2.0,
            max_tracked: max_tracked.max(1),
            inner: Mutex::new(Inner { buckets: HashMap::new(), order: Vec::new() }),
        }
    }

    /// Whether one request from `tenant_id` is admitted now.
    pub fn allow(&self, tenant_id: &str) -> bool {
        self.allow_at(tenant_id, Instant::now())
    }

    fn allow_at(&self, tenant_id: &str, now: Instant) -> bool {
        let mut inner = self.inner.lock().expect("rate limiter mutex poisoned");

        if inner.buckets.contains_key(tenant_id) {
            touch(&mut inner.order, tenant_id);
            let bucket = inner.buckets.get_mut(tenant_id).expect("bucket present");
            let elapsed = now.duration_since(bucket.refreshed).as_secs_f64();
            bucket.tokens = self.capacity.min(bucket.tokens + elapsed * self.rate);
            bucket.refreshed = now;
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return true;
            }
            return false;
        }

        if inner.buckets.len() >= self.max_tracked {
            if let Some(oldest) = inner.order.first().cloned() {
                inner.order.remove(0);
                inner.buckets.remove(&oldest);
            }
        }

        inner.buckets.insert(
            tenant_id.to_string(),
            Bucket { tokens: self.capacity - 1.0, refreshed: now },
        );
        inner.order.push(tenant_id.to_string());
        true
    }
}

fn touch(order: &mut Vec<String>, tenant_id: &str) {
    if let Some(pos) = order.iter().position(|t| t == tenant_id) {
        let tenant = order.remove(pos);
        order.push(tenant);
    }
}
