// Canonical capability manifests (C9) — AgentCard and its nested types.
//
// Field shapes are pinned by `examples/original_source/agents/mesh/
// __tests__/test_models.py`: AgentCapability carries camelCase
// inputModes/outputModes, AgentEndpoint normalizes to a single `/` between
// base and path, and module tags are open strings (not a closed enum) so
// externally-discovered agents with unknown modules still round-trip.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Well-known module tags. Not a closed set — `AgentCard::module` is a
/// plain `String` so discovery can register agents with modules this
/// process has never heard of; these constants are convenience labels
/// for the agents we host ourselves.
pub mod module_tags {
    pub const PROJECT_MANAGEMENT: &str = "project_management";
    pub const KNOWLEDGE_BASE: &str = "knowledge_base";
    pub const CRM: &str = "crm";
    pub const CONTENT: &str = "content";
    pub const CUSTOM: &str = "custom";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AgentHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl Default for AgentHealth {
    fn default() -> Self {
        AgentHealth::Unknown
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapability {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default = "default_modes")]
    pub input_modes: Vec<String>,
    #[serde(default = "default_modes")]
    pub output_modes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

fn default_modes() -> Vec<String> {
    vec!["text".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    pub streaming: bool,
    pub push_notifications: bool,
    pub state_transfer: bool,
}

impl Default for AgentCapabilities {
    fn default() -> Self {
        Self {
            streaming: true,
            push_notifications: false,
            state_transfer: false,
        }
    }
}

/// `{url, path}` pair with a normalizing join — exactly one `/` between
/// base and path regardless of either side's trailing slash.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentEndpoint {
    pub url: String,
    #[serde(default)]
    pub path: String,
}

impl AgentEndpoint {
    pub fn new(url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            path: path.into(),
        }
    }

    pub fn full_url(&self) -> String {
        join_url(&self.url, &self.path)
    }
}

/// Join a base URL and a path with exactly one `/` between them.
pub fn join_url(base: &str, path: &str) -> String {
    if path.is_empty() {
        return base.to_string();
    }
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentCard {
    /// Unique key in the registry.
    pub name: String,
    pub description: String,
    pub url: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    pub is_external: bool,
    pub skills: Vec<AgentCapability>,
    pub capabilities: AgentCapabilities,
    #[serde(default = "default_modes")]
    pub default_input_modes: Vec<String>,
    #[serde(default = "default_output_modes")]
    pub default_output_modes: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_seen: chrono::DateTime<chrono::Utc>,
}

fn default_output_modes() -> Vec<String> {
    vec!["text".to_string(), "tool_calls".to_string()]
}

/// Build a fully-populated card for a hosted agent.
///
/// Grounded in the teacher's `a2a::agent_card` handler, generalized from
/// "derive from the live agent list" to "construct for any agent_id with
/// optional overrides".
pub fn build_agent_card(
    agent_id: &str,
    base_url: &str,
    path: &str,
    custom_skills: Option<Vec<AgentCapability>>,
    custom_description: Option<String>,
) -> AgentCard {
    let now = chrono::Utc::now();
    AgentCard {
        name: agent_id.to_string(),
        description: custom_description
            .unwrap_or_else(|| format!("{agent_id} — hosted mesh agent")),
        url: join_url(base_url, path),
        version: "0.3.0".to_string(),
        module: None,
        is_external: false,
        skills: custom_skills.unwrap_or_default(),
        capabilities: AgentCapabilities::default(),
        default_input_modes: default_modes(),
        default_output_modes: default_output_modes(),
        created_at: now,
        last_seen: now,
    }
}

/// JSON-LD representation used by the discovery endpoints (§6).
pub fn to_json_ld(card: &AgentCard) -> serde_json::Value {
    serde_json::json!({
        "@context": "https://schema.org",
        "@type": "AIAgent",
        "name": card.name,
        "description": card.description,
        "url": card.url,
        "version": card.version,
        "capabilities": {
            "streaming": card.capabilities.streaming,
            "pushNotifications": card.capabilities.push_notifications,
            "stateTransfer": card.capabilities.state_transfer,
        },
        "skills": card.skills.iter().map(|s| serde_json::json!({
            "id": s.id,
            "name": s.name,
            "description": s.description,
            "inputModes": s.input_modes,
            "outputModes": s.output_modes,
        })).collect::<Vec<_>>(),
        "defaultInputModes": card.default_input_modes,
        "defaultOutputModes": card.default_output_modes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_url_joins_with_single_slash() {
        let e = AgentEndpoint::new("https://host.example/", "/path");
        assert_eq!(e.full_url(), "https://host.example/path");
        let e = AgentEndpoint::new("https://host.example", "path");
        assert_eq!(e.full_url(), "https://host.example/path");
    }

    #[test]
    fn full_url_without_path_is_base() {
        let e = AgentEndpoint::new("https://host.example/", "");
        assert_eq!(e.full_url(), "https://host.example");
    }

    #[test]
    fn card_round_trips_through_json_ld_fields() {
        let card = build_agent_card("navi", "https://gw.example", "/a2a", None, None);
        let ld = to_json_ld(&card);
        assert_eq!(ld["name"], "navi");
        assert_eq!(ld["@type"], "AIAgent");
        assert_eq!(ld["defaultOutputModes"][1], "tool_calls");
    }
}
