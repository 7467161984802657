//! Bearer-token authentication for the `/mcp/` surface.
//!
//! A configured static token must arrive as `Authorization: Bearer …`.
//! Loopback clients may pass unauthenticated when the allow-localhost flag
//! is set (the default for local development).

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use crate::config::Settings;

#[derive(Debug, Clone)]
pub struct AuthState {
    pub bearer_token: Option<String>,
    pub allow_localhost: bool,
}

impl AuthState {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            bearer_token: settings.http.bearer_token.clone(),
            allow_localhost: settings.http.allow_localhost_unauthenticated,
        }
    }
}

pub async fn auth_middleware(
    State(auth): State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    if is_authorized(&auth, &request) {
        next.run(request).await
    } else {
        unauthorized()
    }
}

fn is_authorized(auth: &AuthState, request: &Request) -> bool {
    if let Some(expected) = &auth.bearer_token {
        let presented = request
            .headers()
            .get("authorization")
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "));
        if presented == Some(expected.as_str()) {
            return true;
        }
    }
    auth.allow_localhost && is_loopback(request)
}

fn is_loopback(request: &Request) -> bool {
    match request.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => addr.ip().is_loopback(),
        // In-process callers (tests, embedded clients) have no socket.
        None => true,
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "error": {
                "code": "UNAUTHORIZED",
                "message": "provide Authorization: Bearer <token>",
            }
        })),
    )
        .into_response()
}
