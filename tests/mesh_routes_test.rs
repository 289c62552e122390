// Integration tests for the mesh gateway's HTTP surface. Unlike
// `api_tests.rs`, these don't need a real Postgres connection — `MeshState`
// composes entirely in-memory, so the router is built directly against it.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use geminihydra_backend::config::MeshConfig;
use geminihydra_backend::container::{build_mesh_router, MeshState};
use geminihydra_backend::mesh::models::build_agent_card;

fn test_router() -> (axum::Router, std::sync::Arc<MeshState>) {
    let state = MeshState::new(MeshConfig::default(), reqwest::Client::new(), None);
    (build_mesh_router(state.clone()), state)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn register_then_discover_round_trips_the_card() {
    let (router, _state) = test_router();
    let card = build_agent_card("navi", "http://localhost:9001", "", None, None);

    let register = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/agents")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&card).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(register.status(), StatusCode::NO_CONTENT);

    let discovery = router
        .oneshot(Request::builder().uri("/discovery/navi").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(discovery.status(), StatusCode::OK);
    let json = body_json(discovery).await;
    assert_eq!(json["@type"], "AIAgent");
}

#[tokio::test]
async fn unregister_unknown_agent_returns_not_found() {
    let (router, _state) = test_router();
    let response = router
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/agents/ghost")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn registry_stats_reflects_registered_agents() {
    let (router, state) = test_router();
    state
        .registry
        .register(build_agent_card("navi", "http://localhost:9001", "", None, None))
        .await;

    let response = router
        .oneshot(Request::builder().uri("/registry/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["total"], 1);
}

#[tokio::test]
async fn routing_a_task_with_no_agents_reports_failure_not_an_error_status() {
    let (router, _state) = test_router();
    let body = json!({ "task_type": "anything", "message": "hello" });

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/route")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["success"], false);
}

#[tokio::test]
async fn dashboard_snapshot_carries_initial_shape() {
    let (router, _state) = test_router();
    let response = router
        .oneshot(Request::builder().uri("/dashboard").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["activeTasks"].is_array());
    assert!(json["widgets"].is_object());
}

#[tokio::test]
async fn cancel_unknown_task_returns_not_found() {
    let (router, _state) = test_router();
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/tasks/ghost-task/cancel")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn notify_approval_accepts_a_decision_for_an_unknown_id() {
    // The HITL waiter side is allowed to be absent — `notify` just records
    // or drops the decision, it never 404s on an unknown approval id.
    let (router, _state) = test_router();
    let body = json!({ "decision": "APPROVED" });

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/approvals/ghost/notify")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}
