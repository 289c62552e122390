// Service container (§9 redesign note) — the mesh gateway's equivalent of
// `state.rs`'s `AppState`. Python's process-global singletons (one module
// instance each for the registry, router, discovery service, ...) are
// replaced by a single `Arc<MeshState>` composing C1-C7, built once in
// `main.rs` and threaded through axum's `State` extractor exactly the way
// `AppState` already is. Keeps the teacher's `Arc<AtomicBool>` readiness
// flag, `Instant` uptime tracking, and shared `reqwest::Client` reuse.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{delete, get, post};
use axum::Router;
use reqwest::Client;

use crate::aap::AapClient;
use crate::config::MeshConfig;
use crate::gateway::emitter::StateEmitter;
use crate::hitl::approval::ApprovalEventManager;
use crate::hitl::task_manager::TaskManager;
use crate::mesh::discovery::{DiscoveryConfig, DiscoveryService};
use crate::mesh::registry::Registry;
use crate::mesh::router::MeshRouter;
use crate::protocol::aap_endpoint::AgentHandler;

pub struct MeshState {
    pub config: MeshConfig,
    pub registry: Arc<Registry>,
    pub aap: AapClient,
    pub discovery: Arc<DiscoveryService>,
    pub router: Arc<MeshRouter>,
    pub approvals: Arc<ApprovalEventManager>,
    pub tasks: Arc<TaskManager>,
    pub emitter: Arc<StateEmitter>,
    /// The agent this gateway itself hosts, if any — dispatch target for
    /// inbound `sendTask` calls (§4.8.1). `None` means this deployment is
    /// mesh-infrastructure-only (router/discovery/dashboard, no worker).
    pub local_agent_handler: Option<Arc<dyn AgentHandler>>,
    start_time: Instant,
    ready: Arc<AtomicBool>,
}

impl MeshState {
    pub fn new(config: MeshConfig, http: Client, local_agent_handler: Option<Arc<dyn AgentHandler>>) -> Arc<Self> {
        let registry = Registry::new(config.max_subscriber_queue);
        let aap = AapClient::new(http.clone(), registry.clone());
        let discovery = DiscoveryService::new(
            DiscoveryConfig {
                discovery_urls: Vec::new(),
                scan_interval: config.discovery_scan_interval,
                auto_register: true,
                health_check_timeout: config.health_check_timeout,
            },
            registry.clone(),
            http.clone(),
        );
        let router = MeshRouter::new(registry.clone(), aap.clone(), discovery.clone());
        let approvals = ApprovalEventManager::new(config.approval_result_ttl);
        let emitter = StateEmitter::new(config.update_debounce);
        let tasks = TaskManager::new(config.max_concurrent_tasks, Some(emitter.clone()));

        Arc::new(Self {
            config,
            registry,
            aap,
            discovery,
            router,
            approvals,
            tasks,
            emitter,
            local_agent_handler,
            start_time: Instant::now(),
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Starts background subsystems: discovery's periodic scanner and the
    /// approval orphan sweeper. Call once at process startup, after the
    /// container is otherwise fully wired.
    pub async fn start_background_tasks(self: &Arc<Self>) {
        self.discovery.clone().start().await;
        self.approvals.spawn_sweeper();
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

/// Assembles every mesh/protocol handler (AAP JSON-RPC, UIP streaming,
/// discovery, and the registry/router/approval/task/dashboard HTTP glue)
/// into one router carrying its own `Arc<MeshState>`, ready to be nested
/// into the main application router via `nest_service`.
pub fn build_mesh_router(state: Arc<MeshState>) -> Router {
    use crate::mesh::http;
    use crate::protocol::{aap_endpoint, discovery_endpoints, uip};

    Router::new()
        .route("/aap", post(aap_endpoint::handle_aap_request))
        .route("/uip/{agent_id}/run", post(uip::stream_uip_run))
        .route("/discovery", get(discovery_endpoints::global_discovery))
        .route("/discovery/agents", get(discovery_endpoints::list_agents))
        .route("/discovery/{agent_id}", get(discovery_endpoints::agent_discovery))
        .route("/agents", post(http::register_agent))
        .route("/agents/{name}", delete(http::unregister_agent))
        .route("/registry/stats", get(http::registry_stats))
        .route("/route", post(http::route_request))
        .route("/broadcast", post(http::broadcast_request))
        .route("/health", get(http::mesh_health))
        .route("/approvals/{approval_id}/notify", post(http::notify_approval))
        .route("/tasks/{task_id}/cancel", post(http::cancel_task))
        .route("/dashboard", get(http::dashboard_snapshot))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_container_is_not_ready_until_marked() {
        let state = MeshState::new(MeshConfig::default(), Client::new(), None);
        assert!(!state.is_ready());
        state.mark_ready();
        assert!(state.is_ready());
    }

    #[tokio::test]
    async fn container_composes_an_empty_registry_by_default() {
        let state = MeshState::new(MeshConfig::default(), Client::new(), None);
        assert_eq!(state.registry.stats().await.total, 0);
    }
}
