// Jaskier Shared Pattern -- config
// Typed, env-backed configuration for the mesh gateway. Every constant named
// in the external interfaces table gets a field here with the spec default,
// overridable via environment variable.

use std::time::Duration;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub aap_protocol_version: String,
    pub uip_protocol_version: String,
    pub aap_task_timeout: Duration,
    pub discovery_scan_interval: Duration,
    pub health_check_timeout: Duration,
    pub health_check_interval: Duration,
    pub default_step_timeout: Duration,
    pub max_concurrent_tasks: usize,
    pub approval_result_ttl: Duration,
    pub update_debounce: Duration,
    pub max_active_tasks: usize,
    pub max_activities: usize,
    pub max_alerts: usize,
    pub max_subscriber_queue: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            aap_protocol_version: "0.3.0".to_string(),
            uip_protocol_version: "0.1.0".to_string(),
            aap_task_timeout: Duration::from_secs(300),
            discovery_scan_interval: Duration::from_secs(300),
            health_check_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
            default_step_timeout: Duration::from_secs(30),
            max_concurrent_tasks: 100,
            approval_result_ttl: Duration::from_secs(3600),
            update_debounce: Duration::from_millis(120),
            max_active_tasks: 10,
            max_activities: 50,
            max_alerts: 20,
            max_subscriber_queue: 256,
        }
    }
}

impl MeshConfig {
    /// Build from environment, falling back to spec defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            aap_protocol_version: std::env::var("AAP_PROTOCOL_VERSION")
                .unwrap_or(defaults.aap_protocol_version),
            uip_protocol_version: std::env::var("UIP_PROTOCOL_VERSION")
                .unwrap_or(defaults.uip_protocol_version),
            aap_task_timeout: Duration::from_secs(env_u64(
                "AAP_TASK_TIMEOUT_S",
                defaults.aap_task_timeout.as_secs(),
            )),
            discovery_scan_interval: Duration::from_secs(env_u64(
                "DISCOVERY_SCAN_INTERVAL_S",
                defaults.discovery_scan_interval.as_secs(),
            )),
            health_check_timeout: Duration::from_secs(env_u64(
                "HEALTH_CHECK_TIMEOUT_S",
                defaults.health_check_timeout.as_secs(),
            )),
            health_check_interval: Duration::from_secs(env_u64(
                "HEALTH_CHECK_INTERVAL_S",
                defaults.health_check_interval.as_secs(),
            )),
            default_step_timeout: Duration::from_secs(env_u64(
                "DEFAULT_STEP_TIMEOUT_S",
                defaults.default_step_timeout.as_secs(),
            )),
            max_concurrent_tasks: env_usize("MAX_CONCURRENT_TASKS", defaults.max_concurrent_tasks),
            approval_result_ttl: Duration::from_secs(env_u64(
                "APPROVAL_RESULT_TTL_S",
                defaults.approval_result_ttl.as_secs(),
            )),
            update_debounce: Duration::from_millis(env_u64(
                "UPDATE_DEBOUNCE_MS",
                defaults.update_debounce.as_millis() as u64,
            )),
            max_active_tasks: env_usize("MAX_ACTIVE_TASKS", defaults.max_active_tasks),
            max_activities: env_usize("MAX_ACTIVITIES", defaults.max_activities),
            max_alerts: env_usize("MAX_ALERTS", defaults.max_alerts),
            max_subscriber_queue: env_usize(
                "MAX_SUBSCRIBER_QUEUE",
                defaults.max_subscriber_queue,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = MeshConfig::default();
        assert_eq!(cfg.aap_task_timeout, Duration::from_secs(300));
        assert_eq!(cfg.discovery_scan_interval, Duration::from_secs(300));
        assert_eq!(cfg.health_check_timeout, Duration::from_secs(5));
        assert_eq!(cfg.default_step_timeout, Duration::from_secs(30));
        assert_eq!(cfg.max_concurrent_tasks, 100);
        assert_eq!(cfg.approval_result_ttl, Duration::from_secs(3600));
        assert_eq!(cfg.max_active_tasks, 10);
        assert_eq!(cfg.max_activities, 50);
        assert_eq!(cfg.max_alerts, 20);
        assert_eq!(cfg.max_subscriber_queue, 256);
    }
}
