// Discovery endpoint surface (C8.3) — the HTTP-facing mirror of the
// Registry, grounded in `crate::a2a::agent_card`'s `Json<AgentCard>`
// handler shape and `crate::mesh::models::to_json_ld` for the per-agent
// JSON-LD form.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use utoipa::ToSchema;

use crate::container::MeshState;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryManifest {
    pub protocol_version: String,
    pub agents: Vec<crate::mesh::models::AgentCard>,
    pub discovered_at: chrono::DateTime<chrono::Utc>,
}

/// `GET /discovery` — every card this gateway's registry currently holds.
#[utoipa::path(get, path = "/mesh/discovery", tag = "mesh",
    responses((status = 200, description = "Every registered agent card", body = DiscoveryManifest))
)]
pub async fn global_discovery(State(state): State<Arc<MeshState>>) -> Json<DiscoveryManifest> {
    Json(DiscoveryManifest {
        protocol_version: state.config.aap_protocol_version.clone(),
        agents: state.registry.list_all().await,
        discovered_at: chrono::Utc::now(),
    })
}

/// `GET /discovery/{agent_id}` — a single card in JSON-LD form.
#[utoipa::path(get, path = "/mesh/discovery/{agent_id}", tag = "mesh",
    params(("agent_id" = String, Path, description = "Agent name")),
    responses(
        (status = 200, description = "Agent card in JSON-LD form", body = Value),
        (status = 404, description = "No such agent registered"),
    )
)]
pub async fn agent_discovery(
    State(state): State<Arc<MeshState>>,
    Path(agent_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let card = state.registry.get(&agent_id).await.ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(crate::mesh::models::to_json_ld(&card)))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AgentListingEntry {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(rename = "discoveryUrl")]
    pub discovery_url: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AgentListing {
    pub count: usize,
    pub agents: Vec<AgentListingEntry>,
}

/// `GET /discovery/agents` — a lightweight listing for clients that don't
/// need full card bodies.
#[utoipa::path(get, path = "/mesh/discovery/agents", tag = "mesh",
    responses((status = 200, description = "Lightweight agent listing", body = AgentListing))
)]
pub async fn list_agents(State(state): State<Arc<MeshState>>) -> Json<AgentListing> {
    let cards = state.registry.list_all().await;
    let agents: Vec<AgentListingEntry> = cards
        .into_iter()
        .map(|card| AgentListingEntry {
            discovery_url: format!("/discovery/{}", card.name),
            id: card.name.clone(),
            name: card.name,
            url: card.url,
        })
        .collect();
    Json(AgentListing { count: agents.len(), agents })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::models::build_agent_card;

    #[tokio::test]
    async fn listing_reports_count_matching_registered_agents() {
        let state = MeshState::new(crate::config::MeshConfig::default(), reqwest::Client::new(), None);
        state.registry.register(build_agent_card("navi", "http://localhost:9001", "", None, None)).await;
        state.registry.register(build_agent_card("pulse", "http://localhost:9002", "", None, None)).await;

        let Json(listing) = list_agents(State(state)).await;
        assert_eq!(listing.count, 2);
        assert!(listing.agents.iter().any(|a| a.id == "navi"));
    }

    #[tokio::test]
    async fn agent_discovery_returns_not_found_for_unknown_agent() {
        let state = MeshState::new(crate::config::MeshConfig::default(), reqwest::Client::new(), None);
        let result = agent_discovery(State(state), Path("ghost".into())).await;
        assert_eq!(result.unwrap_err(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn agent_discovery_returns_json_ld_context_for_known_agent() {
        let state = MeshState::new(crate::config::MeshConfig::default(), reqwest::Client::new(), None);
        state.registry.register(build_agent_card("navi", "http://localhost:9001", "", None, None)).await;
        let Json(value) = agent_discovery(State(state), Path("navi".into())).await.unwrap();
        assert_eq!(value["@type"], "AIAgent");
    }
}
