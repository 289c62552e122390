// Task Manager (C6) — multi-step long-running operations with per-step
// and overall timeouts, cooperative cancellation, retry, and concurrency
// limits.
//
// Step execution structurally mirrors the teacher's `execute_streaming`/
// `consume_gemini_stream` `tokio::select!` cancellation-observing loop
// (`src/core/execution/mod.rs`), generalized from stream consumption to
// sequential step execution: the cancellation branch is unchanged, the
// "read next stream chunk" branch becomes "await one step's handler under
// a per-step timeout".

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::gateway::emitter::StateEmitter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

pub type StepOutput = Result<Value, String>;
pub type StepHandler =
    Arc<dyn Fn(Option<Value>, Value) -> Pin<Box<dyn Future<Output = StepOutput> + Send>> + Send + Sync>;

#[derive(Clone)]
pub struct StepSpec {
    pub name: String,
    pub handler: StepHandler,
    pub timeout: Option<Duration>,
    pub retries: u32,
}

struct StepRuntime {
    spec: StepSpec,
    state: StepState,
    attempt_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub name: String,
    pub state: StepState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub step_results: Vec<StepResult>,
}

struct ManagedTask {
    id: String,
    name: String,
    state: TaskState,
    steps: Vec<StepRuntime>,
    current_step_index: usize,
    started_at: Instant,
    finished_at: Option<Instant>,
    cancel: CancellationToken,
    result: Option<TaskResult>,
    done_tx: Option<tokio::sync::broadcast::Sender<()>>,
}

pub struct TaskManager {
    tasks: RwLock<HashMap<String, Arc<Mutex<ManagedTask>>>>,
    semaphore: Arc<Semaphore>,
    emitter: Option<Arc<StateEmitter>>,
}

impl TaskManager {
    pub fn new(max_concurrent_tasks: usize, emitter: Option<Arc<StateEmitter>>) -> Arc<Self> {
        Arc::new(Self {
            tasks: RwLock::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(max_concurrent_tasks)),
            emitter,
        })
    }

    pub async fn submit_task(
        self: &Arc<Self>,
        name: &str,
        steps: Vec<StepSpec>,
        context: Value,
        overall_timeout: Option<Duration>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let step_names: Vec<String> = steps.iter().map(|s| s.name.clone()).collect();
        let (done_tx, _) = tokio::sync::broadcast::channel(1);

        let task = Arc::new(Mutex::new(ManagedTask {
            id: id.clone(),
            name: name.to_string(),
            state: TaskState::Pending,
            steps: steps
                .into_iter()
                .map(|spec| StepRuntime { spec, state: StepState::Pending, attempt_count: 0 })
                .collect(),
            current_step_index: 0,
            started_at: Instant::now(),
            finished_at: None,
            cancel: CancellationToken::new(),
            result: None,
            done_tx: Some(done_tx),
        }));

        self.tasks.write().await.insert(id.clone(), task.clone());

        if let Some(emitter) = &self.emitter {
            emitter.start_task(&id, name, step_names, None).await;
        }

        let this = self.clone();
        let task_id = id.clone();
        tokio::spawn(async move {
            let _permit = this.semaphore.acquire().await.expect("semaphore not closed");
            this.run_task(task_id, context, overall_timeout).await;
        });

        id
    }

    async fn run_task(self: &Arc<Self>, task_id: String, context: Value, overall_timeout: Option<Duration>) {
        let Some(task) = self.tasks.read().await.get(&task_id).cloned() else { return };

        {
            let mut guard = task.lock().await;
            guard.state = TaskState::Running;
        }

        let deadline_fut = async {
            if let Some(timeout) = overall_timeout {
                tokio::time::sleep(timeout).await;
            } else {
                std::future::pending::<()>().await;
            }
        };

        let cancel = task.lock().await.cancel.clone();
        let run_fut = self.run_steps(&task, context);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.finish_task(&task, TaskState::Cancelled, None, None).await;
            }
            _ = deadline_fut => {
                self.finish_task(&task, TaskState::Timeout, None, Some("overall timeout exceeded".to_string())).await;
            }
            outcome = run_fut => {
                match outcome {
                    Ok(value) => self.finish_task(&task, TaskState::Completed, Some(value), None).await,
                    Err(e) => self.finish_task(&task, TaskState::Failed, None, Some(e)).await,
                }
            }
        }

        if let Some(emitter) = &self.emitter {
            let guard = task.lock().await;
            match guard.state {
                TaskState::Completed => emitter.complete_task(&task_id).await,
                TaskState::Cancelled => emitter.cancel_task(&task_id).await,
                TaskState::Failed | TaskState::Timeout => {
                    emitter.fail_task(&task_id, guard.result.as_ref().and_then(|r| r.error.clone()).unwrap_or_default()).await
                }
                _ => {}
            }
        }
    }

    async fn run_steps(&self, task: &Arc<Mutex<ManagedTask>>, context: Value) -> Result<Value, String> {
        let mut previous: Option<Value> = None;
        let step_count = task.lock().await.steps.len();

        for index in 0..step_count {
            {
                let mut guard = task.lock().await;
                if guard.cancel.is_cancelled() {
                    guard.steps[index].state = StepState::Pending;
                    return Err("cancelled".to_string());
                }
                guard.current_step_index = index;
                guard.steps[index].state = StepState::Running;
            }

            if let Some(emitter) = &self.emitter {
                let id = task.lock().await.id.clone();
                emitter.update_task_step(&id, index, "running", None, None).await;
            }

            let (handler, timeout, retries) = {
                let guard = task.lock().await;
                let step = &guard.steps[index];
                (step.spec.handler.clone(), step.spec.timeout, step.spec.retries)
            };

            let mut last_err = String::new();
            let mut succeeded = None;

            for attempt in 0..=retries {
                {
                    let mut guard = task.lock().await;
                    guard.steps[index].attempt_count = attempt + 1;
                }
                let step_timeout = timeout.unwrap_or(Duration::from_secs(30));
                let cancel = task.lock().await.cancel.clone();

                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        let mut guard = task.lock().await;
                        guard.steps[index].state = StepState::Pending;
                        return Err("cancelled".to_string());
                    }
                    result = tokio::time::timeout(step_timeout, handler(previous.clone(), context.clone())) => result,
                };

                match outcome {
                    Ok(Ok(value)) => {
                        succeeded = Some(value);
                        break;
                    }
                    Ok(Err(e)) => last_err = e,
                    Err(_) => last_err = format!("step timed out after {step_timeout:?}"),
                }
            }

            match succeeded {
                Some(value) => {
                    let mut guard = task.lock().await;
                    guard.steps[index].state = StepState::Completed;
                    previous = Some(value);
                }
                None => {
                    let mut guard = task.lock().await;
                    guard.steps[index].state = StepState::Failed;
                    return Err(last_err);
                }
            }
        }

        Ok(previous.unwrap_or(Value::Null))
    }

    async fn finish_task(&self, task: &Arc<Mutex<ManagedTask>>, state: TaskState, value: Option<Value>, error: Option<String>) {
        let mut guard = task.lock().await;
        guard.state = state;
        guard.finished_at = Some(Instant::now());
        let duration_ms = guard.finished_at.unwrap().duration_since(guard.started_at).as_millis() as u64;
        let step_results = guard
            .steps
            .iter()
            .map(|s| StepResult { name: s.spec.name.clone(), state: s.state, value: None, error: None })
            .collect();
        guard.result = Some(TaskResult { state, value, error, duration_ms, step_results });
        if let Some(tx) = guard.done_tx.take() {
            let _ = tx.send(());
        }
    }

    pub async fn wait_for_task(&self, task_id: &str) -> Option<TaskResult> {
        let task = self.tasks.read().await.get(task_id).cloned()?;

        loop {
            let mut rx = {
                let guard = task.lock().await;
                if let Some(result) = &guard.result {
                    return Some(result.clone());
                }
                guard.done_tx.as_ref()?.subscribe()
            };
            let _ = rx.recv().await;
        }
    }

    /// Sets the cooperative cancellation flag. The currently executing
    /// step observes it at its next await point; cancelling after
    /// completion is a no-op.
    pub async fn cancel_task(&self, task_id: &str) -> bool {
        let Some(task) = self.tasks.read().await.get(task_id).cloned() else { return false };
        let guard = task.lock().await;
        if matches!(guard.state, TaskState::Completed | TaskState::Failed | TaskState::Cancelled | TaskState::Timeout) {
            return false;
        }
        guard.cancel.cancel();
        true
    }

    /// Removes terminal tasks whose `finished_at` predates `max_age`.
    /// Returns the count removed.
    pub async fn cleanup_completed(&self, max_age: Duration) -> usize {
        let mut tasks = self.tasks.write().await;
        let now = Instant::now();
        let mut to_remove = Vec::new();

        for (id, task) in tasks.iter() {
            let guard = task.lock().await;
            if let Some(finished_at) = guard.finished_at {
                if now.duration_since(finished_at) > max_age {
                    to_remove.push(id.clone());
                }
            }
        }

        for id in &to_remove {
            tasks.remove(id);
        }
        to_remove.len()
    }
}

impl Clone for TaskResult {
    fn clone(&self) -> Self {
        Self {
            state: self.state,
            value: self.value.clone(),
            error: self.error.clone(),
            duration_ms: self.duration_ms,
            step_results: self.step_results.clone(),
        }
    }
}

impl Clone for StepResult {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            state: self.state,
            value: self.value.clone(),
            error: self.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn handler_ok() -> StepHandler {
        Arc::new(|prev: Option<Value>, _ctx| Box::pin(async move { Ok(prev.unwrap_or(Value::from(0))) }))
    }

    fn handler_fail_n_times(n: Arc<AtomicU32>) -> StepHandler {
        Arc::new(move |_prev, _ctx| {
            let n = n.clone();
            Box::pin(async move {
                if n.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("not yet".to_string())
                } else {
                    Ok(Value::from(true))
                }
            })
        })
    }

    #[tokio::test]
    async fn submit_and_wait_completes_task() {
        let mgr = TaskManager::new(10, None);
        let steps = vec![StepSpec { name: "one".into(), handler: handler_ok(), timeout: None, retries: 0 }];
        let id = mgr.submit_task("job", steps, Value::Null, None).await;
        let result = mgr.wait_for_task(&id).await.unwrap();
        assert_eq!(result.state, TaskState::Completed);
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failure() {
        let mgr = TaskManager::new(10, None);
        let counter = Arc::new(AtomicU32::new(0));
        let steps = vec![StepSpec {
            name: "flaky".into(),
            handler: handler_fail_n_times(counter),
            timeout: None,
            retries: 3,
        }];
        let id = mgr.submit_task("job", steps, Value::Null, None).await;
        let result = mgr.wait_for_task(&id).await.unwrap();
        assert_eq!(result.state, TaskState::Completed);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_task() {
        let mgr = TaskManager::new(10, None);
        let handler: StepHandler = Arc::new(|_p, _c| Box::pin(async { Err("always fails".to_string()) }));
        let steps = vec![StepSpec { name: "bad".into(), handler, timeout: None, retries: 1 }];
        let id = mgr.submit_task("job", steps, Value::Null, None).await;
        let result = mgr.wait_for_task(&id).await.unwrap();
        assert_eq!(result.state, TaskState::Failed);
    }

    #[tokio::test]
    async fn cancel_before_first_step_yields_cancelled_with_no_side_effect() {
        let mgr = TaskManager::new(10, None);
        let ran = Arc::new(AtomicU32::new(0));
        let ran2 = ran.clone();
        let handler: StepHandler = Arc::new(move |_p, _c| {
            let ran2 = ran2.clone();
            Box::pin(async move {
                ran2.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            })
        });
        let steps = vec![StepSpec { name: "one".into(), handler, timeout: None, retries: 0 }];
        let id = mgr.submit_task("job", steps, Value::Null, None).await;
        mgr.cancel_task(&id).await;
        let result = mgr.wait_for_task(&id).await.unwrap();
        assert_eq!(result.state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn overall_timeout_fails_task_with_timeout_state() {
        let mgr = TaskManager::new(10, None);
        let handler: StepHandler = Arc::new(|_p, _c| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(Value::Null)
            })
        });
        let steps = vec![StepSpec { name: "slow".into(), handler, timeout: None, retries: 0 }];
        let id = mgr.submit_task("job", steps, Value::Null, Some(Duration::from_millis(20))).await;
        let result = mgr.wait_for_task(&id).await.unwrap();
        assert_eq!(result.state, TaskState::Timeout);
    }

    #[tokio::test]
    async fn cancel_after_completion_is_a_no_op() {
        let mgr = TaskManager::new(10, None);
        let steps = vec![StepSpec { name: "one".into(), handler: handler_ok(), timeout: None, retries: 0 }];
        let id = mgr.submit_task("job", steps, Value::Null, None).await;
        mgr.wait_for_task(&id).await;
        assert!(!mgr.cancel_task(&id).await);
    }
}
