// Dashboard state model (C7 data half). Mirrors the shape recovered from
// `examples/original_source/agents/hitl/__tests__/test_state_emitter_progress.py`:
// a single versioned snapshot with nested widget sections plus a bounded
// set of active tasks, serialized camelCase for the UIP writer.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use utoipa::ToSchema;

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskStepProgress {
    pub name: String,
    pub status: TaskStepStatus,
    /// Clamped to `[0, 100]` on every write — never stored out of range.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub id: String,
    pub name: String,
    pub status: TaskStatus,
    pub steps: Vec<TaskStepProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step_index: Option<usize>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, ToSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct LoadingState {
    pub is_loading: bool,
    pub loading_agents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AlertState {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub title: String,
    pub message: String,
    pub dismissed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub id: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, ToSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ActivityState {
    pub entries: Vec<ActivityEntry>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatusState {
    /// Clamped to `[0, 100]` at construction time — never stored out of range.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl ProjectStatusState {
    pub fn new(progress: i64, summary: Option<String>) -> Self {
        Self { progress: progress.clamp(0, 100) as u8, summary }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema, Default)]
pub struct MetricsState {
    pub values: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, ToSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Widgets {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_status: Option<ProjectStatusState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<ActivityState>,
    pub alerts: Vec<AlertState>,
}

fn serialize_tasks_as_array<S>(tasks: &HashMap<String, TaskProgress>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut ordered: Vec<&TaskProgress> = tasks.values().collect();
    ordered.sort_by_key(|t| t.started_at);
    ordered.serialize(serializer)
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DashboardState {
    pub version: u32,
    pub timestamp_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub widgets: Widgets,
    pub loading: LoadingState,
    pub errors: HashMap<String, String>,
    #[serde(rename = "activeTasks", serialize_with = "serialize_tasks_as_array")]
    pub tasks: HashMap<String, TaskProgress>,
}

impl DashboardState {
    pub fn create_initial() -> Self {
        Self {
            version: STATE_VERSION,
            timestamp_ms: Utc::now().timestamp_millis(),
            active_project: None,
            workspace_id: None,
            user_id: None,
            widgets: Widgets::default(),
            loading: LoadingState::default(),
            errors: HashMap::new(),
            tasks: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_status_clamps_progress_into_range() {
        assert_eq!(ProjectStatusState::new(150, None).progress, 100);
        assert_eq!(ProjectStatusState::new(-5, None).progress, 0);
        assert_eq!(ProjectStatusState::new(42, None).progress, 42);
    }

    #[test]
    fn initial_state_carries_current_version() {
        let state = DashboardState::create_initial();
        assert_eq!(state.version, STATE_VERSION);
        assert!(state.tasks.is_empty());
    }

    #[test]
    fn serializes_active_tasks_as_array_under_camel_case_key() {
        let mut state = DashboardState::create_initial();
        state.tasks.insert(
            "t1".to_string(),
            TaskProgress {
                id: "t1".to_string(),
                name: "job".to_string(),
                status: TaskStatus::Running,
                steps: vec![],
                current_step_index: None,
                started_at: Utc::now(),
                updated_at: Utc::now(),
            },
        );
        let value = serde_json::to_value(&state).unwrap();
        assert!(value.get("activeTasks").unwrap().is_array());
        assert!(value.get("tasks").is_none());
    }

    #[test]
    fn task_step_progress_serializes_clamped_value() {
        let step = TaskStepProgress { name: "fetch".to_string(), status: TaskStepStatus::Running, progress: 100, error: None };
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value.get("progress").unwrap(), 100);
    }
}
