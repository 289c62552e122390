// AAP endpoint surface (C8.1) — the inbound half of the protocol whose
// outbound half is `crate::aap::AapClient`. Any agent mounted behind this
// gateway accepts a JSON-RPC 2.0 `sendTask` envelope and returns a strict
// result-XOR-error response, mirroring `examples/original_source`'s
// `jsonrpc_handler` dispatch table and the teacher's `a2a::message_send`
// handler shape (`src/a2a.rs`), generalized from a single hardcoded
// Gemini-execution path to a pluggable `AgentHandler`.
//
// The wire envelope is structurally the same JSON-RPC 2.0 shape as
// `crate::aap::protocol`, but that module's types are intentionally
// asymmetric (`JsonRpcRequest` is Serialize-only for the outbound caller,
// `JsonRpcResponse` is Deserialize-only for the outbound reader) — so the
// inbound server side gets its own mirror types here rather than
// stretching those to serve both directions.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::aap::protocol::{JsonRpcError, SendTaskParams, SendTaskResult};
use crate::container::MeshState;

#[async_trait::async_trait]
pub trait AgentHandler: Send + Sync {
    async fn handle_task(&self, task: String, context: Option<Value>) -> Result<SendTaskResult, String>;
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct InboundRequest {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    pub params: SendTaskParams,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct InboundResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<SendTaskResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;

/// `POST /aap` — the inbound JSON-RPC 2.0 `sendTask` entry point for the
/// agent this gateway hosts locally.
#[utoipa::path(post, path = "/mesh/aap", tag = "mesh",
    request_body = InboundRequest,
    responses((status = 200, description = "Result-XOR-error JSON-RPC envelope", body = InboundResponse))
)]
pub async fn handle_aap_request(
    State(state): State<Arc<MeshState>>,
    Json(request): Json<InboundRequest>,
) -> Json<InboundResponse> {
    if request.method != "sendTask" {
        return Json(InboundResponse {
            jsonrpc: "2.0",
            id: request.id,
            result: None,
            error: Some(JsonRpcError { code: METHOD_NOT_FOUND, message: format!("unknown method: {}", request.method) }),
        });
    }

    let Some(handler) = state.local_agent_handler.as_ref() else {
        return Json(InboundResponse {
            jsonrpc: "2.0",
            id: request.id,
            result: None,
            error: Some(JsonRpcError { code: INVALID_PARAMS, message: "this gateway hosts no local agent".to_string() }),
        });
    };

    match handler.handle_task(request.params.task, request.params.context).await {
        Ok(result) => Json(InboundResponse { jsonrpc: "2.0", id: request.id, result: Some(result), error: None }),
        Err(message) => Json(InboundResponse {
            jsonrpc: "2.0",
            id: request.id,
            result: None,
            error: Some(JsonRpcError { code: INTERNAL_ERROR, message }),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait::async_trait]
    impl AgentHandler for EchoHandler {
        async fn handle_task(&self, task: String, _context: Option<Value>) -> Result<SendTaskResult, String> {
            Ok(SendTaskResult { content: task, tool_calls: vec![], artifacts: vec![] })
        }
    }

    #[test]
    fn inbound_request_deserializes_send_task_envelope() {
        let request: InboundRequest = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":"1","method":"sendTask","params":{"task":"hi"}}"#,
        )
        .unwrap();
        assert_eq!(request.method, "sendTask");
        assert_eq!(request.params.task, "hi");
    }

    #[test]
    fn response_omits_result_and_error_fields_when_absent() {
        let response = InboundResponse { jsonrpc: "2.0", id: Value::from(1), result: None, error: None };
        let value = serde_json::to_value(&response).unwrap();
        assert!(value.get("result").is_none());
        assert!(value.get("error").is_none());
    }

    #[tokio::test]
    async fn echo_handler_returns_task_as_content() {
        let handler = EchoHandler;
        let result = handler.handle_task("do it".into(), None).await.unwrap();
        assert_eq!(result.content, "do it");
    }
}
