//! Narrow capability traits the gateway consumes.
//!
//! The pipeline depends on four collaborators — evidence, policy,
//! connectors, approvals — each reduced to exactly the operations the
//! handlers call, so tests substitute in-memory implementations.

use std::collections::BTreeMap;

use async_trait::async_trait;

use openclause_core::approvals::{
    ApprovalError, ApprovalGrant, ApprovalRequest, ApprovalStore, CreateApprovalInput,
};
use openclause_core::connectors::{ConnectorError, ConnectorRegistry, ExecRequest, ExecResponse};
use openclause_core::evidence::{EvidenceError, EvidenceStore};
use openclause_core::policy::{PolicyClient, PolicyError};
use openclause_core::types::{PolicyInput, PolicyResult, ToolCallEnvelope, ToolCallResponse};

/// Evidence operations the gateway needs.
pub trait GatewayEvidence: Send + Sync {
    /// Appends an event to its tenant's chain.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn record_event(&self, env: &mut ToolCallEnvelope) -> Result<(), EvidenceError>;

    /// Looks up a prior response for `(tenant, idempotency_key)`.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn check_idempotency(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<ToolCallResponse>, EvidenceError>;

    /// Fetches an event by id.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn get_event(&self, event_id: &str) -> Result<Option<ToolCallEnvelope>, EvidenceError>;

    /// Fetches the canonical execution replay for a parent event.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn get_execution_by_parent(
        &self,
        parent_event_id: &str,
    ) -> Result<Option<ToolCallResponse>, EvidenceError>;

    /// Inserts the exactly-once parent↔execution link.
    ///
    /// # Errors
    ///
    /// Returns an error on non-constraint storage failure.
    fn link_execution_to_parent(
        &self,
        parent_event_id: &str,
        execution_event_id: &str,
        consumed_grant_id: &str,
    ) -> Result<bool, EvidenceError>;

    /// Reads a tenant's configuration options.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn tenant_config(&self, tenant_id: &str) -> Result<BTreeMap<String, String>, EvidenceError>;

    /// Storage liveness probe for readiness checks.
    ///
    /// # Errors
    ///
    /// Returns an error when storage is unreachable.
    fn ping(&self) -> Result<(), EvidenceError>;
}

impl GatewayEvidence for EvidenceStore {
    fn record_event(&self, env: &mut ToolCallEnvelope) -> Result<(), EvidenceError> {
        Self::record_event(self, env)
    }

    fn check_idempotency(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<ToolCallResponse>, EvidenceError> {
        Self::check_idempotency(self, tenant_id, idempotency_key)
    }

    fn get_event(&self, event_id: &str) -> Result<Option<ToolCallEnvelope>, EvidenceError> {
        Self::get_event(self, event_id)
    }

    fn get_execution_by_parent(
        &self,
        parent_event_id: &str,
    ) -> Result<Option<ToolCallResponse>, EvidenceError> {
        Self::get_execution_by_parent(self, parent_event_id)
    }

    fn link_execution_to_parent(
        &self,
        parent_event_id: &str,
        execution_event_id: &str,
        consumed_grant_id: &str,
    ) -> Result<bool, EvidenceError> {
        Self::link_execution_to_parent(self, parent_event_id, execution_event_id, consumed_grant_id)
    }

    fn tenant_config(&self, tenant_id: &str) -> Result<BTreeMap<String, String>, EvidenceError> {
        Self::tenant_config(self, tenant_id)
    }

    fn ping(&self) -> Result<(), EvidenceError> {
        Self::ping(self)
    }
}

/// Policy evaluation as the gateway sees it.
#[async_trait]
pub trait GatewayPolicy: Send + Sync {
    /// Evaluates one request.
    ///
    /// # Errors
    ///
    /// Any error is treated by the caller as deny (fail-closed).
    async fn evaluate(&self, input: &PolicyInput) -> Result<PolicyResult, PolicyError>;
}

#[async_trait]
impl GatewayPolicy for PolicyClient {
    async fn evaluate(&self, input: &PolicyInput) -> Result<PolicyResult, PolicyError> {
        Self::evaluate(self, input).await
    }
}

/// Connector execution as the gateway sees it.
#[async_trait]
pub trait GatewayConnectors: Send + Sync {
    /// Routes the request to its connector.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`]; callers record it as an execution
    /// result rather than failing the request.
    async fn exec(&self, req: &ExecRequest) -> Result<ExecResponse, ConnectorError>;
}

#[async_trait]
impl GatewayConnectors for ConnectorRegistry {
    async fn exec(&self, req: &ExecRequest) -> Result<ExecResponse, ConnectorError> {
        Self::exec(self, req).await
    }
}

/// Approval operations the gateway needs.
pub trait GatewayApprovals: Send + Sync {
    /// Creates a pending approval request with its outbox rows.
    ///
    /// # Errors
    ///
    /// Returns an error on validation or storage failure.
    fn create_request(&self, input: &CreateApprovalInput)
        -> Result<ApprovalRequest, ApprovalError>;

    /// Atomically consumes a matching grant.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn find_and_consume_grant(
        &self,
        tenant_id: &str,
        agent_id: &str,
        tool: &str,
        action: &str,
        resource: &str,
    ) -> Result<Option<ApprovalGrant>, ApprovalError>;
}

impl GatewayApprovals for ApprovalStore {
    fn create_request(
        &self,
        input: &CreateApprovalInput,
    ) -> Result<ApprovalRequest, ApprovalError> {
        Self::create_request(self, input)
    }

    fn find_and_consume_grant(
        &self,
        tenant_id: &str,
        agent_id: &str,
        tool: &str,
        action: &str,
        resource: &str,
    ) -> Result<Option<ApprovalGrant>, ApprovalError> {
        Self::find_and_consume_grant(self, tenant_id, agent_id, tool, action, resource)
    }
}
