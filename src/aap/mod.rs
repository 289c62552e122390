// AAP client (C2) — calls remote agents over JSON-RPC 2.0, single method
// `sendTask` per agent. Never throws on protocol/transport failure; every
// outcome, success or not, is folded into an `AAPResult`.
//
// Grounded in the teacher's `a2a::execute_agent_call`/`execute_a2a_task`
// request-building (POST + JSON body + timeout), generalized from
// Gemini-specific task execution to the spec's generic envelope, and in
// `consume_gemini_stream`'s `tokio::select!`-with-cancellation idiom for
// the parallel fan-out cancellation semantics.

pub mod protocol;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::mesh::registry::Registry;
use protocol::{JsonRpcRequest, JsonRpcResponse};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AapFailureReason {
    NotFound,
    Timeout,
    Connection,
    ProtocolError,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct AAPResult {
    pub agent_id: String,
    pub success: bool,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<Value>,
    #[serde(default)]
    pub artifacts: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl AAPResult {
    fn failure(agent_id: &str, reason: AapFailureReason, message: impl Into<String>, started: Instant) -> Self {
        tracing::warn!(agent_id, ?reason, "aap call failed");
        Self {
            agent_id: agent_id.to_string(),
            success: false,
            content: String::new(),
            tool_calls: Vec::new(),
            artifacts: Vec::new(),
            error: Some(message.into()),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn success(agent_id: &str, result: protocol::SendTaskResult, started: Instant) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            success: true,
            content: result.content,
            tool_calls: result.tool_calls,
            artifacts: result.artifacts,
            error: None,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

#[derive(Clone)]
pub struct AapClient {
    http: Client,
    registry: std::sync::Arc<Registry>,
}

impl AapClient {
    pub fn new(http: Client, registry: std::sync::Arc<Registry>) -> Self {
        Self { http, registry }
    }

    /// Resolve `agent_id`'s URL via the registry and POST a `sendTask`
    /// envelope, bounded by `timeout`. Never throws: every failure mode
    /// (unknown agent, connection error, HTTP >= 400, JSON-RPC error,
    /// malformed body, deadline) resolves to a failure-shaped `AAPResult`.
    pub async fn call_agent(
        &self,
        agent_id: &str,
        task: &str,
        context: Option<Value>,
        timeout: Duration,
    ) -> AAPResult {
        self.call_agent_cancellable(agent_id, task, context, timeout, None)
            .await
    }

    pub async fn call_agent_cancellable(
        &self,
        agent_id: &str,
        task: &str,
        context: Option<Value>,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> AAPResult {
        let started = Instant::now();

        let Some(card) = self.registry.get(agent_id).await else {
            return AAPResult::failure(
                agent_id,
                AapFailureReason::NotFound,
                "unknown agent",
                started,
            );
        };

        let request = JsonRpcRequest::send_task(Uuid::new_v4().to_string(), task.to_string(), context);
        let send_fut = self.http.post(&card.url).json(&request).send();

        let response = if let Some(cancel) = cancel {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return AAPResult::failure(agent_id, AapFailureReason::Cancelled, "cancelled", started);
                }
                result = tokio::time::timeout(timeout, send_fut) => result,
            }
        } else {
            tokio::time::timeout(timeout, send_fut).await
        };

        let response = match response {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                return AAPResult::failure(
                    agent_id,
                    AapFailureReason::Connection,
                    format!("connection error: {e}"),
                    started,
                )
            }
            Err(_) => {
                return AAPResult::failure(
                    agent_id,
                    AapFailureReason::Timeout,
                    format!("timed out after {timeout:?}"),
                    started,
                )
            }
        };

        if response.status().as_u16() >= 400 {
            let status = response.status();
            return AAPResult::failure(
                agent_id,
                AapFailureReason::ProtocolError,
                format!("HTTP {status}"),
                started,
            );
        }

        let body: JsonRpcResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                return AAPResult::failure(
                    agent_id,
                    AapFailureReason::ProtocolError,
                    format!("malformed response: {e}"),
                    started,
                )
            }
        };

        if let Some(err) = body.error {
            return AAPResult::failure(
                agent_id,
                AapFailureReason::ProtocolError,
                format!("[{}] {}", err.code, err.message),
                started,
            );
        }

        match body.result {
            Some(result) => AAPResult::success(agent_id, result, started),
            None => AAPResult::failure(
                agent_id,
                AapFailureReason::ProtocolError,
                "response carried neither result nor error",
                started,
            ),
        }
    }

    /// Fan out to every `(agent_id, task, context)` request concurrently.
    /// A single failure never cancels the others; overall wall time is
    /// bounded by the slowest call, not the sum.
    pub async fn call_agents_parallel(
        &self,
        requests: Vec<(String, String, Option<Value>)>,
        per_call_timeout: Duration,
    ) -> HashMap<String, AAPResult> {
        self.call_agents_parallel_cancellable(requests, per_call_timeout, None)
            .await
    }

    pub async fn call_agents_parallel_cancellable(
        &self,
        requests: Vec<(String, String, Option<Value>)>,
        per_call_timeout: Duration,
        cancel: Option<CancellationToken>,
    ) -> HashMap<String, AAPResult> {
        let futures = requests.into_iter().map(|(agent_id, task, context)| {
            let client = self.clone();
            let cancel = cancel.clone();
            async move {
                let result = client
                    .call_agent_cancellable(&agent_id, &task, context, per_call_timeout, cancel.as_ref())
                    .await;
                (agent_id, result)
            }
        });

        futures_util::future::join_all(futures)
            .await
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_unknown_agent_returns_failure_not_panic() {
        let registry = Registry::new(16);
        let client = AapClient::new(Client::new(), registry);
        let result = client
            .call_agent("ghost", "do it", None, Duration::from_millis(50))
            .await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn parallel_fanout_returns_entry_per_request_even_on_failure() {
        let registry = Registry::new(16);
        let client = AapClient::new(Client::new(), registry);
        let requests = vec![
            ("navi".to_string(), "t".to_string(), None),
            ("pulse".to_string(), "t".to_string(), None),
            ("herald".to_string(), "t".to_string(), None),
        ];
        let results = client
            .call_agents_parallel(requests, Duration::from_millis(50))
            .await;
        assert_eq!(results.len(), 3);
        assert!(results.values().all(|r| !r.success));
    }
}
