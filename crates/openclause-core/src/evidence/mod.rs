//! The evidence store: a per-tenant, hash-chained, append-only audit log.
//!
//! Every tool-call event a gateway accepts lands here exactly once,
//! linked into its tenant's chain. Rows are never updated or deleted;
//! tampering is detectable by recomputing the chain (see [`crate::chain`]).
//!
//! # Concurrency
//!
//! Chain appends run inside `BEGIN IMMEDIATE` transactions. SQLite admits
//! a single writer at a time, so concurrent appenders are serialized and a
//! tenant's chain can never fork — the same guarantee the per-tenant
//! advisory lock provides on a networked store, made global.

mod store;


pub use store::{EvidenceError, EvidenceStore};
