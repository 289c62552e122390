// JSON-RPC 2.0 envelope types for the AAP wire protocol (§6, bit-exact).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SendTaskParams {
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: String,
    pub method: &'static str,
    pub params: SendTaskParams,
}

impl JsonRpcRequest {
    pub fn send_task(id: String, task: String, context: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: "sendTask",
            params: SendTaskParams { task, context },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SendTaskResult {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<Value>,
    #[serde(default)]
    pub artifacts: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<SendTaskResult>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_bit_exact_shape() {
        let req = JsonRpcRequest::send_task("1".into(), "do it".into(), None);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "sendTask");
        assert_eq!(value["params"]["task"], "do it");
        assert!(value["params"].get("context").is_none());
    }

    #[test]
    fn response_parses_success_xor_error() {
        let success: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":"1","result":{"content":"hi","tool_calls":[],"artifacts":[]}}"#,
        )
        .unwrap();
        assert!(success.result.is_some());
        assert!(success.error.is_none());

        let failure: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"1","error":{"code":-32000,"message":"boom"}}"#)
                .unwrap();
        assert!(failure.result.is_none());
        assert_eq!(failure.error.unwrap().message, "boom");
    }
}
