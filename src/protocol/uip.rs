// UIP endpoint surface (C8.2) — the streaming transport a UI client uses
// to watch a single gateway-hosted agent run. Framing follows
// `crate::a2a::message_stream` exactly (`tokio::sync::mpsc` channel feeding
// a spawned task, drained through `ReceiverStream` into `axum::Sse`), but
// the event payload schema is UIP's rather than A2A's `task_status_update`/
// `task_artifact_update` pair, and each event is sent as a bare `data: {json}`
// frame (no `event:` line) per spec §4.8.2 — so this handler builds
// `Event::default().json_data(...)` rather than `.event(name)`.
//
// The one invariant every call path must uphold: exactly one RUN_STARTED
// and exactly one RUN_FINISHED reach the stream, even when the local agent
// errors or panics-as-error. The handler body is structured so the
// RUN_FINISHED send is unconditional regardless of which branch produced
// the result.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::container::MeshState;

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct UipRunRequest {
    pub task: String,
    #[serde(default)]
    pub context: Option<Value>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UipEvent {
    RunStarted { run_id: String, agent_id: String },
    TextMessageChunk { run_id: String, delta: String },
    ToolCallStart { run_id: String, tool_call_id: String, name: String },
    ToolCallArgs { run_id: String, tool_call_id: String, args: Value },
    ToolCallResult { run_id: String, tool_call_id: String, result: Value },
    Error { run_id: String, message: String },
    RunFinished { run_id: String, success: bool },
}

fn frame(event: &UipEvent) -> Event {
    Event::default().json_data(event).unwrap_or_else(|_| Event::default().data("{}"))
}

/// `POST /uip/{agent_id}/run` — stream a single run against a gateway-hosted
/// agent as server-sent `UipEvent` frames.
#[utoipa::path(post, path = "/mesh/uip/{agent_id}/run", tag = "mesh",
    params(("agent_id" = String, Path, description = "Gateway-hosted agent to run")),
    request_body = UipRunRequest,
    responses((status = 200, description = "Server-sent stream of UipEvent frames", content_type = "text/event-stream", body = UipEvent))
)]
pub async fn stream_uip_run(
    State(state): State<Arc<MeshState>>,
    Path(agent_id): Path<String>,
    Json(request): Json<UipRunRequest>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::channel::<Event>(64);
    let run_id = Uuid::new_v4().to_string();

    tokio::spawn(async move {
        let _ = tx.send(frame(&UipEvent::RunStarted { run_id: run_id.clone(), agent_id: agent_id.clone() })).await;

        let Some(handler) = state.local_agent_handler.clone() else {
            let _ = tx
                .send(frame(&UipEvent::Error {
                    run_id: run_id.clone(),
                    message: format!("gateway hosts no local agent named {agent_id}"),
                }))
                .await;
            let _ = tx.send(frame(&UipEvent::RunFinished { run_id, success: false })).await;
            return;
        };

        match handler.handle_task(request.task, request.context).await {
            Ok(result) => {
                if !result.content.is_empty() {
                    let _ = tx
                        .send(frame(&UipEvent::TextMessageChunk { run_id: run_id.clone(), delta: result.content }))
                        .await;
                }
                for (index, call) in result.tool_calls.iter().enumerate() {
                    let tool_call_id = format!("{run_id}-tool-{index}");
                    let name = call.get("name").and_then(Value::as_str).unwrap_or("tool").to_string();
                    let _ = tx
                        .send(frame(&UipEvent::ToolCallStart { run_id: run_id.clone(), tool_call_id: tool_call_id.clone(), name }))
                        .await;
                    let _ = tx
                        .send(frame(&UipEvent::ToolCallArgs {
                            run_id: run_id.clone(),
                            tool_call_id: tool_call_id.clone(),
                            args: call.get("args").cloned().unwrap_or(Value::Null),
                        }))
                        .await;
                    let _ = tx
                        .send(frame(&UipEvent::ToolCallResult {
                            run_id: run_id.clone(),
                            tool_call_id,
                            result: call.get("result").cloned().unwrap_or(Value::Null),
                        }))
                        .await;
                }
                let _ = tx.send(frame(&UipEvent::RunFinished { run_id, success: true })).await;
            }
            Err(message) => {
                let _ = tx.send(frame(&UipEvent::Error { run_id: run_id.clone(), message })).await;
                let _ = tx.send(frame(&UipEvent::RunFinished { run_id, success: false })).await;
            }
        }
    });

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("heartbeat"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_variants_serialize_to_screaming_snake_case_type_tags() {
        let event = UipEvent::RunStarted { run_id: "r1".into(), agent_id: "navi".into() };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "RUN_STARTED");

        let event = UipEvent::TextMessageChunk { run_id: "r1".into(), delta: "hi".into() };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "TEXT_MESSAGE_CHUNK");
    }

    #[test]
    fn run_finished_carries_success_flag() {
        let event = UipEvent::RunFinished { run_id: "r1".into(), success: false };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "RUN_FINISHED");
        assert_eq!(value["success"], false);
    }
}
