// HTTP glue for C1/C4's registry/routing operations — the part of the
// protocol surface that isn't JSON-RPC (AAP) or SSE (UIP). Handler shapes
// follow `crate::handlers::system`'s thin `State -> Json` style.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use utoipa::ToSchema;

use crate::container::MeshState;
use crate::mesh::models::AgentCard;
use crate::mesh::registry::RegistryStats;
use crate::mesh::router::{MeshHealthSummary, RouteOutcome};

/// `POST /agents` — register or replace an agent card in the registry.
#[utoipa::path(post, path = "/mesh/agents", tag = "mesh",
    request_body = AgentCard,
    responses((status = 204, description = "Agent registered"))
)]
pub async fn register_agent(State(state): State<Arc<MeshState>>, Json(card): Json<AgentCard>) -> StatusCode {
    state.registry.register(card).await;
    StatusCode::NO_CONTENT
}

/// `DELETE /agents/{name}` — remove an agent card from the registry.
#[utoipa::path(delete, path = "/mesh/agents/{name}", tag = "mesh",
    params(("name" = String, Path, description = "Agent name")),
    responses(
        (status = 204, description = "Agent unregistered"),
        (status = 404, description = "No such agent registered"),
    )
)]
pub async fn unregister_agent(State(state): State<Arc<MeshState>>, Path(name): Path<String>) -> StatusCode {
    if state.registry.unregister(&name).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// `GET /registry/stats` — counts of registered agents by health/origin.
#[utoipa::path(get, path = "/mesh/registry/stats", tag = "mesh",
    responses((status = 200, description = "Registry composition summary", body = RegistryStats))
)]
pub async fn registry_stats(State(state): State<Arc<MeshState>>) -> Json<RegistryStats> {
    Json(state.registry.stats().await)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RouteRequestBody {
    pub task_type: String,
    pub message: String,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub preferred_module: Option<String>,
}

/// `POST /route` — dispatch a task to the best-matching healthy agent.
#[utoipa::path(post, path = "/mesh/route", tag = "mesh",
    request_body = RouteRequestBody,
    responses((status = 200, description = "Outcome of the routed request", body = RouteOutcome))
)]
pub async fn route_request(
    State(state): State<Arc<MeshState>>,
    Json(body): Json<RouteRequestBody>,
) -> Json<RouteOutcome> {
    let outcome = state
        .router
        .route_request(&body.task_type, &body.message, body.context, body.preferred_module.as_deref())
        .await;
    Json(outcome)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BroadcastRequestBody {
    pub message: String,
    #[serde(default)]
    pub module_filter: Option<String>,
    #[serde(default)]
    pub include_external: bool,
}

/// `POST /broadcast` — fan a message out to every matching agent in parallel.
#[utoipa::path(post, path = "/mesh/broadcast", tag = "mesh",
    request_body = BroadcastRequestBody,
    responses((status = 200, description = "Per-agent outcomes", body = [RouteOutcome]))
)]
pub async fn broadcast_request(
    State(state): State<Arc<MeshState>>,
    Json(body): Json<BroadcastRequestBody>,
) -> Json<Vec<RouteOutcome>> {
    let outcomes = state
        .router
        .broadcast_request(&body.message, body.module_filter.as_deref(), body.include_external)
        .await;
    Json(outcomes)
}

/// `GET /health` — refresh and report mesh-wide agent health.
#[utoipa::path(get, path = "/mesh/health", tag = "mesh",
    responses((status = 200, description = "Mesh health summary", body = MeshHealthSummary))
)]
pub async fn mesh_health(State(state): State<Arc<MeshState>>) -> Json<MeshHealthSummary> {
    Json(state.router.refresh_mesh_health(Some(state.config.health_check_timeout)).await)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct NotifyApprovalBody {
    pub decision: crate::hitl::approval::ApprovalDecision,
    #[serde(default)]
    pub decided_by: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// `POST /approvals/{approval_id}/notify` — deliver an out-of-band HITL
/// decision to whichever call is awaiting it.
#[utoipa::path(post, path = "/mesh/approvals/{approval_id}/notify", tag = "mesh",
    params(("approval_id" = String, Path, description = "Approval request id")),
    request_body = NotifyApprovalBody,
    responses((status = 204, description = "Decision delivered"))
)]
pub async fn notify_approval(
    State(state): State<Arc<MeshState>>,
    Path(approval_id): Path<String>,
    Json(body): Json<NotifyApprovalBody>,
) -> StatusCode {
    state.approvals.notify(&approval_id, body.decision, body.decided_by, body.notes).await;
    StatusCode::NO_CONTENT
}

/// `POST /tasks/{task_id}/cancel` — cooperatively cancel a running task.
#[utoipa::path(post, path = "/mesh/tasks/{task_id}/cancel", tag = "mesh",
    params(("task_id" = String, Path, description = "Task id")),
    responses(
        (status = 204, description = "Cancellation requested"),
        (status = 404, description = "No such task"),
    )
)]
pub async fn cancel_task(State(state): State<Arc<MeshState>>, Path(task_id): Path<String>) -> StatusCode {
    if state.tasks.cancel_task(&task_id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// `GET /dashboard` — the current dashboard state snapshot.
#[utoipa::path(get, path = "/mesh/dashboard", tag = "mesh",
    responses((status = 200, description = "Dashboard state snapshot", body = crate::gateway::state::DashboardState))
)]
pub async fn dashboard_snapshot(State(state): State<Arc<MeshState>>) -> Json<crate::gateway::state::DashboardState> {
    Json(state.emitter.snapshot().await)
}
