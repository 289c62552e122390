// Dashboard state emitter (C7 emitter half).
//
// Subscribers receive the full `DashboardState` snapshot on every
// broadcast, mirroring the teacher's `WsServerMessage` full-state push
// idiom (`src/state.rs`'s `runtime`/`model_cache` consumers broadcasting
// complete snapshots rather than deltas). Delivery uses
// `tokio::sync::watch`, which only ever holds the latest value — exactly
// the semantics a debounced "coalesce rapid updates" emitter wants, since
// a subscriber that is briefly behind skips straight to the newest state
// instead of draining a backlog.
//
// Two emission modes, matching spec §4.7:
//   - `emit_now`: broadcasts immediately, cancelling any pending debounce
//     timer.
//   - `schedule_emit`: if a debounce timer is already pending, it is left
//     alone (the pending emit will pick up the latest mutation); otherwise
//     a timer for `debounce` is armed.
//
// Exactly one timer handle exists at a time, guarded by the same mutex as
// the state itself so "is a timer pending" and "mutate the state" never
// race.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::state::{
    ActivityEntry, ActivityState, AlertState, DashboardState, LoadingState, MetricsState,
    ProjectStatusState, TaskProgress, TaskStepProgress, TaskStepStatus, TaskStatus,
};

const MAX_ACTIVITIES: usize = 50;
const MAX_ALERTS: usize = 20;
const MAX_ACTIVE_TASKS: usize = 10;

struct Inner {
    state: DashboardState,
    pending_timer: Option<JoinHandle<()>>,
}

pub struct StateEmitter {
    inner: Mutex<Inner>,
    tx: watch::Sender<DashboardState>,
    debounce: Duration,
}

impl StateEmitter {
    pub fn new(debounce: Duration) -> Arc<Self> {
        let initial = DashboardState::create_initial();
        let (tx, _rx) = watch::channel(initial.clone());
        Arc::new(Self { inner: Mutex::new(Inner { state: initial, pending_timer: None }), tx, debounce })
    }

    pub fn subscribe(&self) -> watch::Receiver<DashboardState> {
        self.tx.subscribe()
    }

    pub async fn snapshot(&self) -> DashboardState {
        self.inner.lock().await.state.clone()
    }

    async fn emit_now(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.pending_timer.take() {
            handle.abort();
        }
        inner.state.timestamp_ms = chrono::Utc::now().timestamp_millis();
        let _ = self.tx.send(inner.state.clone());
    }

    /// Debounced emit: arms a single timer if none is pending.
    async fn schedule_emit(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.pending_timer.is_some() {
            return;
        }
        let this = self.clone();
        let debounce = self.debounce;
        inner.pending_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let mut inner = this.inner.lock().await;
            inner.pending_timer = None;
            inner.state.timestamp_ms = chrono::Utc::now().timestamp_millis();
            let _ = this.tx.send(inner.state.clone());
        }));
    }

    pub async fn set_active_project(self: &Arc<Self>, project_id: Option<String>) {
        {
            let mut inner = self.inner.lock().await;
            inner.state.active_project = project_id;
        }
        self.schedule_emit().await;
    }

    pub async fn set_workspace(self: &Arc<Self>, workspace_id: Option<String>, user_id: Option<String>) {
        {
            let mut inner = self.inner.lock().await;
            inner.state.workspace_id = workspace_id;
            inner.state.user_id = user_id;
        }
        self.schedule_emit().await;
    }

    /// Immediate emit. Sets `started_at` on the loading→true transition,
    /// clears it on the loading→false transition.
    pub async fn set_loading(self: &Arc<Self>, is_loading: bool, loading_agents: Vec<String>) {
        {
            let mut inner = self.inner.lock().await;
            let started_at = if is_loading {
                inner.state.loading.started_at.or(Some(chrono::Utc::now()))
            } else {
                None
            };
            inner.state.loading = LoadingState { is_loading, loading_agents, started_at };
        }
        self.emit_now().await;
    }

    /// `Some(message)` records/overwrites the agent's error; `None` clears it.
    pub async fn set_error(self: &Arc<Self>, agent: String, message: Option<String>) {
        {
            let mut inner = self.inner.lock().await;
            match message {
                Some(message) => {
                    inner.state.errors.insert(agent, message);
                }
                None => {
                    inner.state.errors.remove(&agent);
                }
            }
        }
        self.schedule_emit().await;
    }

    pub async fn clear_errors(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().await;
            inner.state.errors.clear();
        }
        self.schedule_emit().await;
    }

    pub async fn set_project_status(self: &Arc<Self>, progress: i64, summary: Option<String>) {
        {
            let mut inner = self.inner.lock().await;
            inner.state.widgets.project_status = Some(ProjectStatusState::new(progress, summary));
        }
        self.schedule_emit().await;
    }

    pub async fn set_metrics(self: &Arc<Self>, values: HashMap<String, f64>) {
        {
            let mut inner = self.inner.lock().await;
            inner.state.widgets.metrics = Some(MetricsState { values });
        }
        self.schedule_emit().await;
    }

    /// Appends a single activity entry (newest first), truncating to
    /// `MAX_ACTIVITIES` and setting `has_more` if truncation occurred.
    pub async fn add_activity(self: &Arc<Self>, id: String, summary: String) {
        {
            let mut inner = self.inner.lock().await;
            push_activity(&mut inner.state.widgets, id, summary);
        }
        self.schedule_emit().await;
    }

    /// Replaces the activity list wholesale — used when a caller already
    /// has a complete, ordered batch (e.g. `update_from_gather`).
    pub async fn set_activity(self: &Arc<Self>, activities: Vec<(String, String)>, has_more: bool) {
        {
            let mut inner = self.inner.lock().await;
            let mut entries: Vec<ActivityEntry> = activities
                .into_iter()
                .map(|(id, summary)| ActivityEntry { id, summary, created_at: chrono::Utc::now() })
                .collect();
            let mut has_more = has_more;
            if entries.len() > MAX_ACTIVITIES {
                entries.truncate(MAX_ACTIVITIES);
                has_more = true;
            }
            inner.state.widgets.activity = Some(ActivityState { entries, has_more });
        }
        self.schedule_emit().await;
    }

    /// Prepends an alert (newest first), truncates to `MAX_ALERTS`, and
    /// returns the id — caller-supplied if given, otherwise generated.
    pub async fn add_alert(
        self: &Arc<Self>,
        alert_type: String,
        title: String,
        message: String,
        id: Option<String>,
    ) -> String {
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        {
            let mut inner = self.inner.lock().await;
            inner.state.widgets.alerts.insert(
                0,
                AlertState {
                    id: id.clone(),
                    alert_type,
                    title,
                    message,
                    dismissed: false,
                    created_at: chrono::Utc::now(),
                },
            );
            inner.state.widgets.alerts.truncate(MAX_ALERTS);
        }
        self.emit_now().await;
        id
    }

    pub async fn dismiss_alert(self: &Arc<Self>, id: &str) {
        {
            let mut inner = self.inner.lock().await;
            if let Some(alert) = inner.state.widgets.alerts.iter_mut().find(|a| a.id == id) {
                alert.dismissed = true;
            }
        }
        self.emit_now().await;
    }

    pub async fn clear_alerts(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().await;
            inner.state.widgets.alerts.clear();
        }
        self.emit_now().await;
    }

    /// Emits immediately — a task entering existence is never coalesced
    /// away. Excess submissions beyond `MAX_ACTIVE_TASKS` are dropped with
    /// a warning rather than silently overflowing the dashboard.
    pub async fn start_task(self: &Arc<Self>, id: &str, name: &str, step_names: Vec<String>, current_step_index: Option<usize>) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state.tasks.len() >= MAX_ACTIVE_TASKS && !inner.state.tasks.contains_key(id) {
                tracing::warn!(task_id = id, limit = MAX_ACTIVE_TASKS, "dropping task start, active-task limit reached");
                return;
            }
            let now = chrono::Utc::now();
            inner.state.tasks.insert(
                id.to_string(),
                TaskProgress {
                    id: id.to_string(),
                    name: name.to_string(),
                    status: TaskStatus::Running,
                    steps: step_names
                        .into_iter()
                        .map(|name| TaskStepProgress { name, status: TaskStepStatus::Pending, progress: 0, error: None })
                        .collect(),
                    current_step_index,
                    started_at: now,
                    updated_at: now,
                },
            );
        }
        self.emit_now().await;
    }

    /// Intermediate step progress is debounced — a fast-moving task does
    /// not flood subscribers with one broadcast per step. `progress`, if
    /// given, is clamped to `[0, 100]` before being stored.
    pub async fn update_task_step(
        self: &Arc<Self>,
        id: &str,
        step_index: usize,
        status: &str,
        progress: Option<i64>,
        error: Option<String>,
    ) {
        {
            let mut inner = self.inner.lock().await;
            if let Some(task) = inner.state.tasks.get_mut(id) {
                if let Some(step) = task.steps.get_mut(step_index) {
                    step.status = match status {
                        "running" => TaskStepStatus::Running,
                        "completed" => TaskStepStatus::Completed,
                        "failed" => TaskStepStatus::Failed,
                        _ => step.status,
                    };
                    if let Some(p) = progress {
                        step.progress = p.clamp(0, 100) as u8;
                    }
                    step.error = error;
                }
                task.current_step_index = Some(step_index);
                task.updated_at = chrono::Utc::now();
            }
        }
        self.schedule_emit().await;
    }

    /// Marks all remaining steps COMPLETED and emits immediately —
    /// terminal states are never debounced.
    pub async fn complete_task(self: &Arc<Self>, id: &str) {
        {
            let mut inner = self.inner.lock().await;
            if let Some(task) = inner.state.tasks.get_mut(id) {
                task.status = TaskStatus::Completed;
                for step in &mut task.steps {
                    step.status = TaskStepStatus::Completed;
                }
                task.updated_at = chrono::Utc::now();
            }
        }
        self.emit_now().await;
    }

    /// Marks the currently running step FAILED (other steps untouched)
    /// and emits immediately.
    pub async fn fail_task(self: &Arc<Self>, id: &str, error: String) {
        {
            let mut inner = self.inner.lock().await;
            if let Some(task) = inner.state.tasks.get_mut(id) {
                task.status = TaskStatus::Failed;
                if let Some(index) = task.current_step_index {
                    if let Some(step) = task.steps.get_mut(index) {
                        step.status = TaskStepStatus::Failed;
                        step.error = Some(error);
                    }
                }
                task.updated_at = chrono::Utc::now();
            }
        }
        self.emit_now().await;
    }

    /// Marks the currently running step back to PENDING (distinguishing a
    /// cancellation from a failure) and emits immediately.
    pub async fn cancel_task(self: &Arc<Self>, id: &str) {
        {
            let mut inner = self.inner.lock().await;
            if let Some(task) = inner.state.tasks.get_mut(id) {
                task.status = TaskStatus::Cancelled;
                if let Some(index) = task.current_step_index {
                    if let Some(step) = task.steps.get_mut(index) {
                        step.status = TaskStepStatus::Pending;
                    }
                }
                task.updated_at = chrono::Utc::now();
            }
        }
        self.emit_now().await;
    }

    /// Removing a finished task from the dashboard is debounced — it is
    /// cosmetic housekeeping, not a state transition subscribers need to
    /// see immediately.
    pub async fn remove_task(self: &Arc<Self>, id: &str) {
        {
            let mut inner = self.inner.lock().await;
            inner.state.tasks.remove(id);
        }
        self.schedule_emit().await;
    }

    /// Bulk ingestion from a parallel agent gather: each `Some` widget
    /// input replaces its slot, `errors` replaces the whole error map in
    /// one shot, and the result is always emitted immediately — a gather
    /// result is never stale by the time it lands.
    pub async fn update_from_gather(
        self: &Arc<Self>,
        project_status: Option<(i64, Option<String>)>,
        metrics: Option<HashMap<String, f64>>,
        activities: Vec<(String, String)>,
        errors: Option<HashMap<String, String>>,
    ) {
        {
            let mut inner = self.inner.lock().await;
            if let Some((progress, summary)) = project_status {
                inner.state.widgets.project_status = Some(ProjectStatusState::new(progress, summary));
            }
            if let Some(values) = metrics {
                inner.state.widgets.metrics = Some(MetricsState { values });
            }
            for (id, summary) in activities {
                push_activity(&mut inner.state.widgets, id, summary);
            }
            if let Some(errors) = errors {
                inner.state.errors = errors;
            }
        }
        self.emit_now().await;
    }
}

fn push_activity(widgets: &mut super::state::Widgets, id: String, summary: String) {
    let activity = widgets.activity.get_or_insert_with(ActivityState::default);
    activity.entries.insert(0, ActivityEntry { id, summary, created_at: chrono::Utc::now() });
    if activity.entries.len() > MAX_ACTIVITIES {
        activity.entries.truncate(MAX_ACTIVITIES);
        activity.has_more = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_loading_emits_immediately_and_tracks_started_at() {
        let emitter = StateEmitter::new(Duration::from_millis(200));
        let mut rx = emitter.subscribe();
        emitter.set_loading(true, vec!["navi".into()]).await;
        rx.changed().await.unwrap();
        assert!(rx.borrow().loading.is_loading);
        assert!(rx.borrow().loading.started_at.is_some());

        emitter.set_loading(false, vec![]).await;
        rx.changed().await.unwrap();
        assert!(!rx.borrow().loading.is_loading);
        assert!(rx.borrow().loading.started_at.is_none());
    }

    #[tokio::test]
    async fn set_error_is_keyed_by_agent_and_clearable() {
        let emitter = StateEmitter::new(Duration::from_millis(5));
        emitter.set_error("navi".into(), Some("boom".into())).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(emitter.snapshot().await.errors.get("navi").unwrap(), "boom");

        emitter.set_error("navi".into(), None).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(emitter.snapshot().await.errors.is_empty());
    }

    #[tokio::test]
    async fn add_alert_returns_id_and_truncates() {
        let emitter = StateEmitter::new(Duration::from_millis(5));
        let id = emitter.add_alert("warning".into(), "heads up".into(), "disk low".into(), None).await;
        let snapshot = emitter.snapshot().await;
        assert_eq!(snapshot.widgets.alerts[0].id, id);
        assert!(!snapshot.widgets.alerts[0].dismissed);

        emitter.dismiss_alert(&id).await;
        let snapshot = emitter.snapshot().await;
        assert!(snapshot.widgets.alerts[0].dismissed);
    }

    #[tokio::test]
    async fn task_lifecycle_marks_remaining_steps_completed() {
        let emitter = StateEmitter::new(Duration::from_millis(5));
        emitter.start_task("t1", "job", vec!["a".into(), "b".into(), "c".into()], None).await;
        emitter.update_task_step("t1", 0, "completed", Some(100), None).await;
        emitter.complete_task("t1").await;

        let snapshot = emitter.snapshot().await;
        let task = snapshot.tasks.get("t1").unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.steps.iter().all(|s| s.status == TaskStepStatus::Completed));
    }

    #[tokio::test]
    async fn fail_task_marks_only_running_step_failed() {
        let emitter = StateEmitter::new(Duration::from_millis(5));
        emitter.start_task("t2", "job", vec!["a".into(), "b".into()], None).await;
        emitter.update_task_step("t2", 1, "running", None, None).await;
        emitter.fail_task("t2", "boom".into()).await;

        let snapshot = emitter.snapshot().await;
        let task = snapshot.tasks.get("t2").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.steps[0].status, TaskStepStatus::Pending);
        assert_eq!(task.steps[1].status, TaskStepStatus::Failed);
    }

    #[tokio::test]
    async fn cancel_task_resets_running_step_to_pending() {
        let emitter = StateEmitter::new(Duration::from_millis(5));
        emitter.start_task("t3", "job", vec!["a".into()], None).await;
        emitter.update_task_step("t3", 0, "running", None, None).await;
        emitter.cancel_task("t3").await;

        let snapshot = emitter.snapshot().await;
        let task = snapshot.tasks.get("t3").unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.steps[0].status, TaskStepStatus::Pending);
    }

    #[tokio::test]
    async fn excess_task_starts_are_dropped_once_limit_reached() {
        let emitter = StateEmitter::new(Duration::from_millis(5));
        for i in 0..(MAX_ACTIVE_TASKS + 3) {
            emitter.start_task(&format!("t{i}"), "job", vec!["a".into()], None).await;
        }
        let snapshot = emitter.snapshot().await;
        assert_eq!(snapshot.tasks.len(), MAX_ACTIVE_TASKS);
    }

    #[tokio::test]
    async fn activity_truncates_and_sets_has_more() {
        let emitter = StateEmitter::new(Duration::from_millis(5));
        for i in 0..(MAX_ACTIVITIES + 5) {
            emitter.add_activity(format!("a{i}"), "did something".into()).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        let snapshot = emitter.snapshot().await;
        let activity = snapshot.widgets.activity.unwrap();
        assert_eq!(activity.entries.len(), MAX_ACTIVITIES);
        assert!(activity.has_more);
    }

    #[tokio::test]
    async fn rapid_step_updates_coalesce_to_latest_value() {
        let emitter = StateEmitter::new(Duration::from_millis(50));
        emitter.start_task("t4", "job", vec!["a".into(), "b".into()], None).await;
        let mut rx = emitter.subscribe();
        rx.changed().await.unwrap(); // consume start_task's immediate emit

        emitter.update_task_step("t4", 0, "running", None, None).await;
        emitter.update_task_step("t4", 0, "completed", None, None).await;
        emitter.update_task_step("t4", 1, "running", None, None).await;

        rx.changed().await.unwrap();
        let task = rx.borrow().tasks.get("t4").unwrap().clone();
        assert_eq!(task.steps[0].status, TaskStepStatus::Completed);
        assert_eq!(task.steps[1].status, TaskStepStatus::Running);
    }

    #[tokio::test]
    async fn update_task_step_clamps_progress_into_range() {
        let emitter = StateEmitter::new(Duration::from_millis(5));
        emitter.start_task("t5", "job", vec!["a".into()], None).await;
        emitter.update_task_step("t5", 0, "running", Some(150), None).await;

        let snapshot = emitter.snapshot().await;
        assert_eq!(snapshot.tasks.get("t5").unwrap().steps[0].progress, 100);

        emitter.update_task_step("t5", 0, "running", Some(-10), None).await;
        let snapshot = emitter.snapshot().await;
        assert_eq!(snapshot.tasks.get("t5").unwrap().steps[0].progress, 0);
    }

    #[tokio::test]
    async fn update_from_gather_replaces_errors_and_emits_immediately() {
        let emitter = StateEmitter::new(Duration::from_millis(200));
        let mut rx = emitter.subscribe();
        let mut errors = HashMap::new();
        errors.insert("herald".to_string(), "timed out".to_string());
        emitter
            .update_from_gather(Some((50, Some("halfway".into()))), None, vec![], Some(errors))
            .await;
        rx.changed().await.unwrap();
        let snapshot = rx.borrow();
        assert_eq!(snapshot.errors.get("herald").unwrap(), "timed out");
        assert_eq!(snapshot.widgets.project_status.as_ref().unwrap().progress, 50);
    }
}
