//! Login, logout and the bearer check in front of `/mcp`.
//!
//! - Callers submit a password to `/api/auth/login` and get a session JWT back
//! - `/mcp` and `/api/auth/logout` require `Authorization: Bearer <jwt>`
//! - A missing or rejected token is answered with HTTP 401 carrying a
//!   JSON-RPC error (-32001), so MCP clients see a protocol-level failure

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde_json::Value;

use super::routes::AppState;
use super::types::{LoginRequest, LoginResponse, LogoutResponse};
use crate::auth::{AuthError, Session};
use crate::mcp::types::{JsonRpcResponse, AUTH_ERROR};

/// Token from an `Authorization: Bearer` header, if any.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())?;
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// HTTP 401 with a JSON-RPC auth error body.
pub fn unauthorized(message: impl Into<String>) -> Response {
    let body = JsonRpcResponse::error(Value::Null, AUTH_ERROR, message);
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, String)> {
    match state.auth.authenticate(req.username.as_deref(), &req.password) {
        Ok(session) => Ok(Json(LoginResponse {
            token: session.token,
            exp: session.expires_at.timestamp(),
            owner: session.owner,
        })),
        Err(AuthError::Rejected) => Err((StatusCode::UNAUTHORIZED, "Invalid credentials".to_string())),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

pub async fn logout(Extension(session): Extension<Session>, State(state): State<Arc<AppState>>) -> Response {
    match state.auth.logout(&session.token) {
        Ok(_) => Json(LogoutResponse { logged_out: true }).into_response(),
        Err(e) => unauthorized(format!("Authentication failed: {}", e)),
    }
}

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(req.headers()) else {
        return unauthorized("Missing Authorization header");
    };

    match state.auth.validate(token) {
        Ok(session) => {
            req.extensions_mut().insert(session);
            next.run(req).await
        }
        Err(e) => {
            tracing::debug!("Rejected bearer token: {}", e);
            unauthorized(format!("Authentication failed: {}", e))
        }
    }
}
