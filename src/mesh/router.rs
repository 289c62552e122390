// Capability-based router (C4). Selection priority order is pinned by
// `examples/original_source/agents/mesh/__tests__/test_router.py`'s
// `TestRoutingPriority`:
//   1. preferred_module + capability match
//   2. capability match (module-agnostic)
//   3. internal preferred over external at every stage
//   4. module-only fallback when preferred_module is set
//   5. any healthy agent
// with a stateful round-robin tiebreak among the final candidate set,
// keyed by `task_type`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use utoipa::ToSchema;

use crate::aap::AapClient;
use crate::mesh::discovery::DiscoveryService;
use crate::mesh::models::AgentCard;
use crate::mesh::registry::Registry;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RouteOutcome {
    pub agent: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingInfo {
    pub task_type: String,
    pub total_agents: usize,
    pub healthy_agents: usize,
    pub capability_matches: usize,
    pub selected_agent: Option<String>,
    pub is_external: Option<bool>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MeshHealthSummary {
    pub healthy_count: usize,
    pub total_count: usize,
    pub healthy_ratio: f64,
    pub agents: HashMap<String, crate::mesh::discovery::AgentHealthCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct MeshRouter {
    registry: Arc<Registry>,
    aap: AapClient,
    discovery: Arc<DiscoveryService>,
    round_robin_index: Mutex<HashMap<String, usize>>,
}

impl MeshRouter {
    pub fn new(registry: Arc<Registry>, aap: AapClient, discovery: Arc<DiscoveryService>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            aap,
            discovery,
            round_robin_index: Mutex::new(HashMap::new()),
        })
    }

    /// Reset round-robin state. Mirrors the Python `reset_router()`'s
    /// effect on `_round_robin_index`; here it's a method on an explicit
    /// instance rather than a module-level singleton reset (§9).
    pub async fn reset_round_robin(&self) {
        self.round_robin_index.lock().await.clear();
    }

    pub async fn find_agent(&self, task_type: &str, preferred_module: Option<&str>) -> Option<AgentCard> {
        let healthy = self.registry.list_healthy().await;
        if healthy.is_empty() {
            return None;
        }

        let has_capability = |c: &AgentCard| c.skills.iter().any(|s| s.id == task_type);

        // 1. preferred_module + capability match.
        if let Some(module) = preferred_module {
            let candidates: Vec<&AgentCard> = healthy
                .iter()
                .filter(|c| c.module.as_deref() == Some(module) && has_capability(c))
                .collect();
            if !candidates.is_empty() {
                return self.pick(task_type, candidates).await;
            }
        }

        // 2. capability match, any module; 3. internal preferred over external.
        let capability_matches: Vec<&AgentCard> = healthy.iter().filter(|c| has_capability(c)).collect();
        if !capability_matches.is_empty() {
            let internal: Vec<&AgentCard> = capability_matches
                .iter()
                .filter(|c| !c.is_external)
                .copied()
                .collect();
            let pool = if !internal.is_empty() { internal } else { capability_matches };
            return self.pick(task_type, pool).await;
        }

        // 4. module-only fallback.
        if let Some(module) = preferred_module {
            let module_only: Vec<&AgentCard> = healthy.iter().filter(|c| c.module.as_deref() == Some(module)).collect();
            if !module_only.is_empty() {
                return self.pick(task_type, module_only).await;
            }
        }

        // 5. any healthy agent.
        let all: Vec<&AgentCard> = healthy.iter().collect();
        self.pick(task_type, all).await
    }

    /// Stateful round-robin among the final candidate set for this
    /// `task_type`. The index advances modulo the candidate count so
    /// repeated calls rotate through the whole set.
    async fn pick(&self, task_type: &str, mut candidates: Vec<&AgentCard>) -> Option<AgentCard> {
        if candidates.is_empty() {
            return None;
        }
        // Stable order so round-robin is deterministic across calls.
        candidates.sort_by(|a, b| a.name.cmp(&b.name));

        let mut indices = self.round_robin_index.lock().await;
        let idx = indices.entry(task_type.to_string()).or_insert(0);
        let chosen = candidates[*idx % candidates.len()].clone();
        *idx = (*idx + 1) % candidates.len();
        Some(chosen)
    }

    pub async fn find_agents_for_broadcast(
        &self,
        module_filter: Option<&str>,
        capability_filter: Option<&str>,
        include_external: bool,
    ) -> Vec<AgentCard> {
        self.registry
            .list_healthy()
            .await
            .into_iter()
            .filter(|c| module_filter.map_or(true, |m| c.module.as_deref() == Some(m)))
            .filter(|c| capability_filter.map_or(true, |cap| c.skills.iter().any(|s| s.id == cap)))
            .filter(|c| include_external || !c.is_external)
            .collect()
    }

    pub async fn route_request(
        &self,
        task_type: &str,
        message: &str,
        context: Option<Value>,
        preferred_module: Option<&str>,
    ) -> RouteOutcome {
        let Some(agent) = self.find_agent(task_type, preferred_module).await else {
            return RouteOutcome {
                agent: String::new(),
                success: false,
                content: None,
                error: Some(format!("No agent found for task_type '{task_type}'")),
                duration_ms: 0,
            };
        };

        let result = self
            .aap
            .call_agent(&agent.name, message, context, Duration::from_secs(300))
            .await;

        RouteOutcome {
            agent: agent.name,
            success: result.success,
            content: if result.success { Some(result.content) } else { None },
            error: result.error,
            duration_ms: result.duration_ms,
        }
    }

    pub async fn broadcast_request(
        &self,
        message: &str,
        module_filter: Option<&str>,
        include_external: bool,
    ) -> Vec<RouteOutcome> {
        let agents = self.find_agents_for_broadcast(module_filter, None, include_external).await;
        let requests: Vec<_> = agents
            .iter()
            .map(|a| (a.name.clone(), message.to_string(), None))
            .collect();
        let results = self.aap.call_agents_parallel(requests, Duration::from_secs(300)).await;

        agents
            .into_iter()
            .map(|a| {
                let r = results.get(&a.name);
                RouteOutcome {
                    agent: a.name.clone(),
                    success: r.map(|r| r.success).unwrap_or(false),
                    content: r.and_then(|r| if r.success { Some(r.content.clone()) } else { None }),
                    error: r.and_then(|r| r.error.clone()),
                    duration_ms: r.map(|r| r.duration_ms).unwrap_or(0),
                }
            })
            .collect()
    }

    pub async fn get_routing_info(&self, task_type: &str, preferred_module: Option<&str>) -> RoutingInfo {
        let all = self.registry.list_all().await;
        let healthy = self.registry.list_healthy().await;
        let capability_matches = healthy.iter().filter(|c| c.skills.iter().any(|s| s.id == task_type)).count();
        let selected = self.find_agent(task_type, preferred_module).await;

        RoutingInfo {
            task_type: task_type.to_string(),
            total_agents: all.len(),
            healthy_agents: healthy.len(),
            capability_matches,
            is_external: selected.as_ref().map(|c| c.is_external),
            selected_agent: selected.map(|c| c.name),
        }
    }

    /// Delegates to Discovery's parallel health sweep. Special cases per
    /// `test_parallel_health.py`: discovery not running yields a zeroed
    /// summary with an `error`; discovery running with zero external
    /// agents yields the same zero counts but *no* error.
    pub async fn refresh_mesh_health(&self, timeout: Option<Duration>) -> MeshHealthSummary {
        if !self.discovery.is_running().await {
            return MeshHealthSummary {
                healthy_count: 0,
                total_count: 0,
                healthy_ratio: 1.0,
                agents: HashMap::new(),
                error: Some("discovery service is not running".to_string()),
            };
        }

        let agents = self.discovery.health_check_all(timeout).await;
        let total = agents.len();
        let healthy = agents.values().filter(|a| a.healthy).count();
        let ratio = if total == 0 { 1.0 } else { healthy as f64 / total as f64 };

        MeshHealthSummary {
            healthy_count: healthy,
            total_count: total,
            healthy_ratio: ratio,
            agents,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::discovery::DiscoveryConfig;
    use crate::mesh::models::{AgentCapabilities, AgentCapability};
    use reqwest::Client;

    fn card(name: &str, module: Option<&str>, external: bool, skills: &[&str]) -> AgentCard {
        let now = chrono::Utc::now();
        AgentCard {
            name: name.to_string(),
            description: "t".to_string(),
            url: "http://localhost".to_string(),
            version: "0.3.0".to_string(),
            module: module.map(|m| m.to_string()),
            is_external: external,
            skills: skills
                .iter()
                .map(|s| AgentCapability {
                    id: s.to_string(),
                    name: s.to_string(),
                    description: "".into(),
                    input_modes: vec!["text".into()],
                    output_modes: vec!["text".into()],
                    tags: None,
                })
                .collect(),
            capabilities: AgentCapabilities::default(),
            default_input_modes: vec!["text".into()],
            default_output_modes: vec!["text".into()],
            created_at: now,
            last_seen: now,
        }
    }

    async fn router() -> Arc<MeshRouter> {
        let registry = Registry::new(16);
        let aap = AapClient::new(Client::new(), registry.clone());
        let discovery = DiscoveryService::new(DiscoveryConfig::default(), registry.clone(), Client::new());
        MeshRouter::new(registry, aap, discovery)
    }

    #[tokio::test]
    async fn internal_preferred_over_external() {
        let router = router().await;
        router
            .registry
            .register(card("external-a", None, true, &["planning"]))
            .await;
        router
            .registry
            .register(card("internal-a", Some("pm"), false, &["planning"]))
            .await;

        let chosen = router.find_agent("planning", None).await.unwrap();
        assert_eq!(chosen.name, "internal-a");
    }

    #[tokio::test]
    async fn round_robin_tiebreak_rotates_through_all_candidates() {
        let router = router().await;
        for name in ["a0", "a1", "a2"] {
            router.registry.register(card(name, Some("pm"), false, &["task"])).await;
        }

        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            let chosen = router.find_agent("task", Some("pm")).await.unwrap();
            seen.insert(chosen.name);
        }
        assert_eq!(seen.len(), 3);

        // Next cycle starts over.
        let fourth = router.find_agent("task", Some("pm")).await.unwrap();
        assert_eq!(fourth.name, "a0");
    }

    #[tokio::test]
    async fn module_and_capability_beats_capability_only() {
        let router = router().await;
        router.registry.register(card("other-module", Some("crm"), false, &["planning"])).await;
        router.registry.register(card("pm-agent", Some("pm"), false, &["planning"])).await;

        let chosen = router.find_agent("planning", Some("pm")).await.unwrap();
        assert_eq!(chosen.name, "pm-agent");
    }

    #[tokio::test]
    async fn fallback_to_any_healthy_when_nothing_matches() {
        let router = router().await;
        router.registry.register(card("only-agent", Some("crm"), false, &["unrelated"])).await;

        let chosen = router.find_agent("planning", Some("pm")).await.unwrap();
        assert_eq!(chosen.name, "only-agent");
    }

    #[tokio::test]
    async fn no_healthy_agents_returns_none() {
        let router = router().await;
        assert!(router.find_agent("planning", None).await.is_none());
    }

    #[tokio::test]
    async fn refresh_mesh_health_without_discovery_started_reports_error() {
        let router = router().await;
        let summary = router.refresh_mesh_health(None).await;
        assert_eq!(summary.healthy_count, 0);
        assert_eq!(summary.total_count, 0);
        assert_eq!(summary.healthy_ratio, 1.0);
        assert!(summary.error.is_some());
    }
}
