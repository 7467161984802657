//! The `/mcp/` surface: protocol handshake, tool calls, resources, auth.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use mailroom::engine::Engine;
use mailroom::server::router;
use mailroom::Settings;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

fn test_app(bearer_token: Option<&str>) -> (TempDir, axum::Router) {
    let dir = TempDir::new().unwrap();
    let mut settings = Settings::for_storage_root(dir.path());
    settings.http.bearer_token = bearer_token.map(str::to_string);
    if bearer_token.is_some() {
        settings.http.allow_localhost_unauthenticated = false;
    }
    let engine = Arc::new(Engine::new(settings).unwrap());
    (dir, router(engine))
}

fn rpc_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/mcp/")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn initialize_handshake() {
    let (_dir, app) = test_app(None);
    let response = app
        .oneshot(rpc_request(json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["result"]["serverInfo"]["name"], "mailroom");
    assert!(body["result"]["capabilities"]["tools"].is_object());
}

#[tokio::test]
async fn notifications_return_accepted_without_body() {
    let (_dir, app) = test_app(None);
    let response = app
        .oneshot(rpc_request(json!({
            "jsonrpc": "2.0", "method": "notifications/initialized"
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn tools_list_exposes_schemas() {
    let (_dir, app) = test_app(None);
    let response = app
        .oneshot(rpc_request(json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/list"
        })))
        .await
        .unwrap();
    let body = json_body(response).await;
    let tools = body["result"]["tools"].as_array().unwrap();
    assert!(tools.len() >= 24);
    let ensure = tools
        .iter()
        .find(|t| t["name"] == "ensure_project")
        .expect("ensure_project listed");
    assert!(ensure["inputSchema"]["properties"]["human_key"].is_object());
}

#[tokio::test]
async fn tool_call_roundtrip() {
    let (_dir, app) = test_app(None);

    let response = app
        .clone()
        .oneshot(rpc_request(json!({
            "jsonrpc": "2.0", "id": 3, "method": "tools/call",
            "params": { "name": "ensure_project", "arguments": { "human_key": "/p/demo" } }
        })))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["result"]["isError"], false);
    let slug = body["result"]["structuredContent"]["slug"].as_str().unwrap();
    assert!(slug.starts_with("p-demo-"));

    let response = app
        .oneshot(rpc_request(json!({
            "jsonrpc": "2.0", "id": 4, "method": "tools/call",
            "params": { "name": "register_agent", "arguments": {
                "project_key": "/p/demo", "program": "claude-code",
                "model": "test", "name": "Alpha", "task_description": "t"
            } }
        })))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["result"]["structuredContent"]["name"], "Alpha");
}

#[tokio::test]
async fn tool_errors_carry_stable_codes() {
    let (_dir, app) = test_app(None);
    let response = app
        .oneshot(rpc_request(json!({
            "jsonrpc": "2.0", "id": 5, "method": "tools/call",
            "params": { "name": "whois", "arguments": {
                "project_key": "/p/none", "agent_name": "Ghost"
            } }
        })))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["result"]["isError"], true);
    assert_eq!(
        body["result"]["structuredContent"]["error"]["code"],
        "PROJECT_NOT_FOUND"
    );
}

#[tokio::test]
async fn unknown_method_is_rejected() {
    let (_dir, app) = test_app(None);
    let response = app
        .oneshot(rpc_request(json!({
            "jsonrpc": "2.0", "id": 6, "method": "no/such/method"
        })))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], -32601);
}

#[tokio::test]
async fn resources_list_and_read() {
    let (_dir, app) = test_app(None);

    app.clone()
        .oneshot(rpc_request(json!({
            "jsonrpc": "2.0", "id": 7, "method": "tools/call",
            "params": { "name": "ensure_project", "arguments": { "human_key": "/p/demo" } }
        })))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(rpc_request(json!({
            "jsonrpc": "2.0", "id": 8, "method": "resources/list"
        })))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert!(body["result"]["resources"].as_array().unwrap().len() >= 7);

    let response = app
        .oneshot(rpc_request(json!({
            "jsonrpc": "2.0", "id": 9, "method": "resources/read",
            "params": { "uri": "resource://projects" }
        })))
        .await
        .unwrap();
    let body = json_body(response).await;
    let text = body["result"]["contents"][0]["text"].as_str().unwrap();
    let projects: Value = serde_json::from_str(text).unwrap();
    assert_eq!(projects.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn bearer_auth_enforced_when_configured() {
    let (_dir, app) = test_app(Some("sekrit"));

    let response = app
        .clone()
        .oneshot(rpc_request(json!({
            "jsonrpc": "2.0", "id": 10, "method": "ping"
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let mut request = rpc_request(json!({ "jsonrpc": "2.0", "id": 11, "method": "ping" }));
    request
        .headers_mut()
        .insert("authorization", "Bearer sekrit".parse().unwrap());
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut request = rpc_request(json!({ "jsonrpc": "2.0", "id": 12, "method": "ping" }));
    request
        .headers_mut()
        .insert("authorization", "Bearer wrong".parse().unwrap());
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn batch_requests_are_rejected() {
    let (_dir, app) = test_app(None);
    let response = app
        .oneshot(rpc_request(json!([
            { "jsonrpc": "2.0", "id": 1, "method": "ping" }
        ])))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
