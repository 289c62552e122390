// Approval store collaborator (spec §6 supplement). The HITL engine
// (`crate::hitl`) never depends on this module directly — it only needs
// something that can durably record a FULL-tier approval request and
// look it up later for audit/UI purposes, while the actual wait/notify
// handshake lives entirely in `crate::hitl::approval::ApprovalEventManager`
// (in-memory, transport-agnostic). This trait is the seam a deployment
// plugs a concrete store into; `postgres` below is the one reference
// implementation the gateway ships, backed by the teacher's existing
// `sqlx`/Postgres pool.

pub mod postgres;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::MeshResult;
use crate::hitl::approval::ApprovalDecision;

#[derive(Debug, Clone)]
pub struct NewApprovalRequest {
    pub approval_id: String,
    pub approval_type: String,
    pub risk_level: String,
    pub confidence_score: i32,
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRecord {
    pub approval_id: String,
    pub approval_type: String,
    pub risk_level: String,
    pub confidence_score: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<ApprovalDecision>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn create(&self, request: NewApprovalRequest) -> MeshResult<ApprovalRecord>;
    async fn get(&self, approval_id: &str) -> MeshResult<Option<ApprovalRecord>>;
    async fn record_decision(&self, approval_id: &str, decision: ApprovalDecision) -> MeshResult<()>;
}
