//! # openclause-daemon
//!
//! The OpenClause services as one binary with three roles:
//!
//! - **gateway** — the agent-facing ingress: validation, rate limiting,
//!   idempotency, policy evaluation, decision dispatch, and the
//!   approve-then-execute resume protocol.
//! - **approvals** — the approver-facing API plus the Slack interaction
//!   callback and the notification dispatcher loop.
//! - **archiver** — periodic verified snapshots of the evidence chain to
//!   object storage.
//!
//! All three share one SQLite database; the library crate
//! (`openclause-core`) owns every invariant, this crate owns the HTTP
//! surface and process wiring.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod approvals_http;
pub mod archiver_run;
pub mod gateway;
pub mod metrics;
pub mod middleware;
