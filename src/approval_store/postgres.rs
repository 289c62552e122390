// Postgres-backed `ApprovalStore` (reference implementation). Grounded in
// `crate::state::AppState`'s `sqlx::query_as`/`PgPool` usage and the
// `gh_a2a_tasks` table pattern in `crate::a2a` — same bind-by-position
// style, same "log and continue" treatment of non-fatal write failures
// where the caller doesn't need the write to have landed immediately.

use async_trait::async_trait;
use sqlx::PgPool;

use super::{ApprovalRecord, ApprovalStore, NewApprovalRequest};
use crate::error::{MeshError, MeshResult};
use crate::hitl::approval::ApprovalDecision;

#[derive(sqlx::FromRow)]
struct ApprovalRow {
    approval_id: String,
    approval_type: String,
    risk_level: String,
    confidence_score: i32,
    requested_by: Option<String>,
    decision: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<ApprovalRow> for ApprovalRecord {
    fn from(row: ApprovalRow) -> Self {
        Self {
            approval_id: row.approval_id,
            approval_type: row.approval_type,
            risk_level: row.risk_level,
            confidence_score: row.confidence_score,
            requested_by: row.requested_by,
            decision: row.decision.and_then(|d| match d.as_str() {
                "APPROVED" => Some(ApprovalDecision::Approved),
                "REJECTED" => Some(ApprovalDecision::Rejected),
                "EXPIRED" => Some(ApprovalDecision::Expired),
                "CANCELLED" => Some(ApprovalDecision::Cancelled),
                _ => None,
            }),
            created_at: row.created_at,
        }
    }
}

fn decision_code(decision: ApprovalDecision) -> &'static str {
    match decision {
        ApprovalDecision::Approved => "APPROVED",
        ApprovalDecision::Rejected => "REJECTED",
        ApprovalDecision::Expired => "EXPIRED",
        ApprovalDecision::Cancelled => "CANCELLED",
    }
}

pub struct PostgresApprovalStore {
    pool: PgPool,
}

impl PostgresApprovalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApprovalStore for PostgresApprovalStore {
    async fn create(&self, request: NewApprovalRequest) -> MeshResult<ApprovalRecord> {
        let row = sqlx::query_as::<_, ApprovalRow>(
            "INSERT INTO gh_approval_requests \
                (approval_id, approval_type, risk_level, confidence_score, requested_by) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING approval_id, approval_type, risk_level, confidence_score, requested_by, decision, created_at",
        )
        .bind(&request.approval_id)
        .bind(&request.approval_type)
        .bind(&request.risk_level)
        .bind(request.confidence_score)
        .bind(&request.requested_by)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| MeshError::Internal(e.into()))?;

        Ok(row.into())
    }

    async fn get(&self, approval_id: &str) -> MeshResult<Option<ApprovalRecord>> {
        let row = sqlx::query_as::<_, ApprovalRow>(
            "SELECT approval_id, approval_type, risk_level, confidence_score, requested_by, decision, created_at \
             FROM gh_approval_requests WHERE approval_id = $1",
        )
        .bind(approval_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| MeshError::Internal(e.into()))?;

        Ok(row.map(ApprovalRecord::from))
    }

    async fn record_decision(&self, approval_id: &str, decision: ApprovalDecision) -> MeshResult<()> {
        let result = sqlx::query("UPDATE gh_approval_requests SET decision = $1 WHERE approval_id = $2")
            .bind(decision_code(decision))
            .bind(approval_id)
            .execute(&self.pool)
            .await
            .map_err(|e| MeshError::Internal(e.into()))?;

        if result.rows_affected() == 0 {
            return Err(MeshError::NotFound(approval_id.to_string()));
        }
        Ok(())
    }
}
