//! The HTTP surface: an axum router exposing MCP over streamable HTTP.
//!
//! One POST endpoint (default `/mcp/`) accepts JSON-RPC requests and
//! returns JSON responses; notifications get `202 Accepted`. Auth is a
//! static bearer token with an optional localhost escape hatch.

pub mod auth;
pub mod resources;
pub mod rpc;
pub mod tools;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::engine::Engine;
use crate::error::{MailroomError, Result};

use auth::{auth_middleware, AuthState};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

pub fn router(engine: Arc<Engine>) -> Router {
    let auth_state = AuthState::from_settings(engine.settings());
    let path = engine.settings().http.path.clone();
    let state = AppState { engine };
    Router::new()
        .route(&path, post(handle_mcp))
        .layer(middleware::from_fn_with_state(auth_state, auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_mcp(State(state): State<AppState>, Json(body): Json<serde_json::Value>) -> Response {
    if body.is_array() {
        // Batches are not part of the streamable-HTTP profile we speak.
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": { "code": -32600, "message": "batch requests are not supported" },
            })),
        )
            .into_response();
    }
    match rpc::handle(&state.engine, body).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// Bind and serve until the process is stopped.
pub async fn serve(engine: Arc<Engine>) -> Result<()> {
    let settings = engine.settings().clone();
    let app = router(engine);
    let addr = format!("{}:{}", settings.http.host, settings.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|err| MailroomError::Config(format!("cannot bind {addr}: {err}")))?;
    info!(addr = %addr, path = %settings.http.path, "mailroom listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
