// Discovery service (C3) — fetches capability manifests from known URLs,
// registers them, and continuously verifies liveness via parallel health
// sweeps.
//
// Exact behavior pinned by `examples/original_source/agents/mesh/
// __tests__/test_discovery.py` and `test_parallel_health.py`: `start()`
// performs exactly one initial scan before the periodic task; failure
// taxonomy is NotFound/Connection/Timeout/Validation; `health_check_all`
// only evaluates external agents; parallel operations complete in
// roughly max-latency, not sum-of-latencies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::mesh::models::{AgentCapabilities, AgentCapability, AgentCard};
use crate::mesh::registry::Registry;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub discovery_urls: Vec<String>,
    pub scan_interval: Duration,
    pub auto_register: bool,
    pub health_check_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery_urls: Vec::new(),
            scan_interval: Duration::from_secs(300),
            auto_register: true,
            health_check_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("agent not found at {0}")]
    NotFound(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("invalid agent card: {0}")]
    InvalidCard(String),
}

#[derive(Debug, Deserialize)]
struct RawCard {
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    module: Option<String>,
    #[serde(default)]
    skills: Vec<RawSkill>,
}

#[derive(Debug, Deserialize)]
struct RawSkill {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, rename = "inputModes")]
    input_modes: Vec<String>,
    #[serde(default, rename = "outputModes")]
    output_modes: Vec<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

fn parse_agent_card(body: &str, base_url: &str) -> Result<AgentCard, DiscoveryError> {
    let raw: RawCard =
        serde_json::from_str(body).map_err(|e| DiscoveryError::InvalidCard(format!("malformed JSON: {e}")))?;
    let Some(name) = raw.name.filter(|n| !n.is_empty()) else {
        return Err(DiscoveryError::InvalidCard("missing 'name' field".to_string()));
    };

    let now = chrono::Utc::now();
    Ok(AgentCard {
        name,
        description: raw.description,
        url: raw.url.unwrap_or_else(|| base_url.to_string()),
        version: raw.version.unwrap_or_else(|| "0.3.0".to_string()),
        module: raw.module,
        is_external: true,
        skills: raw
            .skills
            .into_iter()
            .map(|s| AgentCapability {
                id: s.id,
                name: s.name,
                description: s.description,
                input_modes: if s.input_modes.is_empty() { vec!["text".into()] } else { s.input_modes },
                output_modes: if s.output_modes.is_empty() { vec!["text".into()] } else { s.output_modes },
                tags: s.tags,
            })
            .collect(),
        capabilities: AgentCapabilities::default(),
        default_input_modes: vec!["text".to_string()],
        default_output_modes: vec!["text".to_string(), "tool_calls".to_string()],
        created_at: now,
        last_seen: now,
    })
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct AgentHealthCheck {
    pub healthy: bool,
    pub response_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectResult {
    pub agent_id: String,
    pub success: bool,
    pub tools_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_scheduled: bool,
    pub connect_time_ms: u64,
}

pub struct DiscoveryService {
    config: RwLock<DiscoveryConfig>,
    registry: Arc<Registry>,
    http: Client,
    is_running: AtomicBool,
    scan_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DiscoveryService {
    pub fn new(config: DiscoveryConfig, registry: Arc<Registry>, http: Client) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(config),
            registry,
            http,
            is_running: AtomicBool::new(false),
            scan_task: Mutex::new(None),
        })
    }

    pub async fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub async fn add_discovery_url(&self, url: String) -> bool {
        let mut config = self.config.write().await;
        if config.discovery_urls.contains(&url) {
            false
        } else {
            config.discovery_urls.push(url);
            true
        }
    }

    pub async fn remove_discovery_url(&self, url: &str) -> bool {
        let mut config = self.config.write().await;
        let before = config.discovery_urls.len();
        config.discovery_urls.retain(|u| u != url);
        config.discovery_urls.len() != before
    }

    /// Returns an owned snapshot — mutating it does not affect internal state.
    pub async fn get_discovery_urls(&self) -> Vec<String> {
        self.config.read().await.discovery_urls.clone()
    }

    pub async fn discover_agent(&self, url: &str) -> Result<AgentCard, DiscoveryError> {
        let response = tokio::time::timeout(
            self.config.read().await.health_check_timeout,
            self.http.get(url).send(),
        )
        .await
        .map_err(|_| DiscoveryError::Timeout(self.config.read().await.health_check_timeout))?
        .map_err(|e| {
            if e.is_connect() {
                DiscoveryError::Connection(format!("connection failed: {e}"))
            } else {
                DiscoveryError::Connection(e.to_string())
            }
        })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DiscoveryError::NotFound(url.to_string()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| DiscoveryError::Connection(e.to_string()))?;
        let card = parse_agent_card(&body, url)?;

        let auto_register = self.config.read().await.auto_register;
        if auto_register {
            self.registry.register(card.clone()).await;
        }
        Ok(card)
    }

    /// Discovers all configured URLs in parallel; independent failures are
    /// isolated and only successes are returned.
    pub async fn scan(&self) -> Result<Vec<AgentCard>, DiscoveryError> {
        if !self.is_running().await {
            return Err(DiscoveryError::InvalidCard("discovery service not started".to_string()));
        }

        let urls = self.get_discovery_urls().await;
        let futures = urls.iter().map(|url| self.discover_agent(url));
        let results = futures_util::future::join_all(futures).await;

        Ok(results
            .into_iter()
            .filter_map(|r| match r {
                Ok(card) => Some(card),
                Err(e) => {
                    tracing::warn!("discovery: scan failed for one url: {e}");
                    None
                }
            })
            .collect())
    }

    pub async fn start(self: &Arc<Self>) {
        self.is_running.store(true, Ordering::Release);
        if let Err(e) = self.scan().await {
            tracing::warn!("discovery: initial scan failed: {e}");
        }

        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let interval = this.config.read().await.scan_interval;
                tokio::time::sleep(interval).await;
                if !this.is_running().await {
                    break;
                }
                if let Err(e) = this.scan().await {
                    tracing::warn!("discovery: periodic scan failed: {e}");
                }
            }
        });
        *self.scan_task.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        self.is_running.store(false, Ordering::Release);
        if let Some(handle) = self.scan_task.lock().await.take() {
            handle.abort();
        }
    }

    pub async fn check_agent_health(&self, name: &str, timeout: Duration) -> crate::mesh::models::AgentHealth {
        let Some(card) = self.registry.get(name).await else {
            return crate::mesh::models::AgentHealth::Unknown;
        };

        let healthy = tokio::time::timeout(timeout, self.http.get(&card.url).send())
            .await
            .map(|r| r.map(|resp| resp.status().is_success()).unwrap_or(false))
            .unwrap_or(false);

        self.registry.update_health(name, healthy).await;
        self.registry.get_health(name).await
    }

    /// Parallel sweep over all external agents with a per-agent timeout.
    /// Internal agents are excluded from the result map entirely.
    pub async fn health_check_all(&self, timeout: Option<Duration>) -> HashMap<String, AgentHealthCheck> {
        let timeout = timeout.unwrap_or(self.config.read().await.health_check_timeout);
        let external = self.registry.list_external().await;

        let futures = external.into_iter().map(|card| {
            let http = self.http.clone();
            let registry = self.registry.clone();
            async move {
                let started = Instant::now();
                let outcome = tokio::time::timeout(timeout, http.get(&card.url).send()).await;
                let check = match outcome {
                    Ok(Ok(resp)) if resp.status().is_success() => AgentHealthCheck {
                        healthy: true,
                        response_time_ms: started.elapsed().as_secs_f64() * 1000.0,
                        error: None,
                    },
                    Ok(Ok(resp)) => AgentHealthCheck {
                        healthy: false,
                        response_time_ms: started.elapsed().as_secs_f64() * 1000.0,
                        error: Some(format!("unhealthy status {}", resp.status())),
                    },
                    Ok(Err(e)) => AgentHealthCheck {
                        healthy: false,
                        response_time_ms: started.elapsed().as_secs_f64() * 1000.0,
                        error: Some(format!("unhealthy: {e}")),
                    },
                    Err(_) => AgentHealthCheck {
                        healthy: false,
                        response_time_ms: timeout.as_secs_f64() * 1000.0,
                        error: Some("Timeout waiting for health check".to_string()),
                    },
                };
                registry.update_health(&card.name, check.healthy).await;
                (card.name, check)
            }
        });

        futures_util::future::join_all(futures).await.into_iter().collect()
    }

    /// Parallel bulk connect. Timeout on a single agent degrades only
    /// that agent; the rest complete normally.
    pub async fn connect_all(&self, subset: Option<Vec<String>>, timeout: Duration) -> Vec<ConnectResult> {
        let targets: Vec<String> = match subset {
            Some(names) => names,
            None => self.registry.list_external().await.into_iter().map(|c| c.name).collect(),
        };

        let futures = targets.into_iter().map(|name| {
            let this_http = self.http.clone();
            let registry = self.registry.clone();
            async move {
                let started = Instant::now();
                let Some(card) = registry.get(&name).await else {
                    return ConnectResult {
                        agent_id: name,
                        success: false,
                        tools_count: 0,
                        error: Some("unknown agent".to_string()),
                        retry_scheduled: false,
                        connect_time_ms: started.elapsed().as_millis() as u64,
                    };
                };

                match tokio::time::timeout(timeout, this_http.get(&card.url).send()).await {
                    Ok(Ok(resp)) if resp.status().is_success() => ConnectResult {
                        agent_id: card.name,
                        success: true,
                        tools_count: card.skills.len(),
                        error: None,
                        retry_scheduled: false,
                        connect_time_ms: started.elapsed().as_millis() as u64,
                    },
                    Ok(Ok(resp)) => ConnectResult {
                        agent_id: card.name,
                        success: false,
                        tools_count: 0,
                        error: Some(format!("HTTP {}", resp.status())),
                        retry_scheduled: true,
                        connect_time_ms: started.elapsed().as_millis() as u64,
                    },
                    Ok(Err(e)) => ConnectResult {
                        agent_id: card.name,
                        success: false,
                        tools_count: 0,
                        error: Some(e.to_string()),
                        retry_scheduled: true,
                        connect_time_ms: started.elapsed().as_millis() as u64,
                    },
                    Err(_) => ConnectResult {
                        agent_id: card.name,
                        success: false,
                        tools_count: 0,
                        error: Some("connect timed out".to_string()),
                        retry_scheduled: true,
                        connect_time_ms: started.elapsed().as_millis() as u64,
                    },
                }
            }
        });

        futures_util::future::join_all(futures).await
    }

    /// Exponential-backoff retry per agent, stopping once successful or
    /// retries are exhausted.
    pub async fn retry_failed_connections(
        &self,
        names: Vec<String>,
        max_retries: u32,
        backoff_base: Duration,
        timeout: Duration,
    ) -> Vec<ConnectResult> {
        let futures = names.into_iter().map(|name| {
            let this = self;
            async move {
                let mut attempt = 0;
                loop {
                    let results = this.connect_all(Some(vec![name.clone()]), timeout).await;
                    let result = results.into_iter().next().unwrap();
                    if result.success || attempt >= max_retries {
                        return result;
                    }
                    attempt += 1;
                    tokio::time::sleep(backoff_base * 2u32.pow(attempt - 1)).await;
                }
            }
        });
        futures_util::future::join_all(futures).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_agent_card_rejects_missing_name() {
        let err = parse_agent_card(r#"{"description":"x"}"#, "http://base").unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidCard(ref m) if m.contains("missing 'name'")));
    }

    #[test]
    fn parse_agent_card_defaults_url_to_base() {
        let card = parse_agent_card(r#"{"name":"navi"}"#, "http://base.example").unwrap();
        assert_eq!(card.url, "http://base.example");
        assert!(card.is_external);
        assert!(card.skills.is_empty());
    }

    #[tokio::test]
    async fn constructor_defaults_match_spec() {
        let registry = Registry::new(16);
        let svc = DiscoveryService::new(DiscoveryConfig::default(), registry, Client::new());
        assert!(!svc.is_running().await);
        assert_eq!(svc.get_discovery_urls().await.len(), 0);
    }

    #[tokio::test]
    async fn add_remove_discovery_url_dedupes() {
        let registry = Registry::new(16);
        let svc = DiscoveryService::new(DiscoveryConfig::default(), registry, Client::new());
        assert!(svc.add_discovery_url("http://a".to_string()).await);
        assert!(!svc.add_discovery_url("http://a".to_string()).await);
        assert!(svc.remove_discovery_url("http://a").await);
        assert!(!svc.remove_discovery_url("http://a").await);
    }

    #[tokio::test]
    async fn scan_before_start_errors() {
        let registry = Registry::new(16);
        let svc = DiscoveryService::new(DiscoveryConfig::default(), registry, Client::new());
        let err = svc.scan().await.unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidCard(ref m) if m.contains("not started")));
    }

    #[tokio::test]
    async fn health_check_all_excludes_internal_agents() {
        let registry = Registry::new(16);
        let now = chrono::Utc::now();
        registry
            .register(AgentCard {
                name: "internal".to_string(),
                description: "".into(),
                url: "http://localhost".into(),
                version: "0.3.0".into(),
                module: None,
                is_external: false,
                skills: vec![],
                capabilities: AgentCapabilities::default(),
                default_input_modes: vec![],
                default_output_modes: vec![],
                created_at: now,
                last_seen: now,
            })
            .await;
        let svc = DiscoveryService::new(DiscoveryConfig::default(), registry, Client::new());
        let results = svc.health_check_all(Some(Duration::from_millis(50))).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn get_discovery_urls_returns_owned_copy() {
        let registry = Registry::new(16);
        let svc = DiscoveryService::new(DiscoveryConfig::default(), registry, Client::new());
        svc.add_discovery_url("http://a".to_string()).await;
        let mut urls = svc.get_discovery_urls().await;
        urls.push("http://b".to_string());
        assert_eq!(svc.get_discovery_urls().await.len(), 1);
    }
}
