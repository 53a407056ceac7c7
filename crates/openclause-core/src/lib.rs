//! # openclause-core
//!
//! Core library for OpenClause, a policy-enforcement and human-approval
//! plane for AI-agent tool invocations. Every agent request to act on an
//! external system is validated, evaluated against a declarative policy,
//! optionally routed to a human approver, executed exactly once on
//! approval, and recorded in a per-tenant tamper-evident audit chain.
//!
//! ## Subsystems
//!
//! - **Canonical codec + hash chain** ([`canonical`], [`chain`]): stable
//!   byte-level JSON and domain-separated SHA-256 linking.
//! - **Evidence store** ([`evidence`]): transactional append-only event
//!   log with idempotency and an exactly-once parent↔execution link.
//! - **Approval store** ([`approvals`]): request/grant state machine and
//!   the transactional notification outbox.
//! - **Policy client** ([`policy`]): HTTP adapter for the external rule
//!   evaluator, fail-closed on every failure mode.
//! - **Connector registry** ([`connectors`]): tool→endpoint routing with
//!   a bounded HTTP client.
//! - **Notification dispatcher** ([`notify`]): outbox polling, signed
//!   webhook and messenger delivery with capped exponential backoff.
//! - **Archiver** ([`archive`]): incremental verified snapshots of the
//!   evidence chain to object storage.
//! - **SDK** ([`sdk`]): a typed client for agents integrating against
//!   the gateway.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod approvals;
pub mod archive;
pub mod auth;
pub mod canonical;
pub mod chain;
pub mod config;
pub mod connectors;
pub mod evidence;
mod httpbody;
pub mod notify;
pub mod policy;
pub mod ratelimit;
pub mod sdk;
pub mod types;

pub use types::{Decision, ExecutionResult, PolicyResult, ToolCallEnvelope, ToolCallRequest};
