//! Gateway HTTP handlers
//!
//! Dispatcher listener, reachable from sessions:
//!
//! - POST /api/v1/command: decide and run one git/gh command
//!
//! Admin listener, for the orchestrator:
//!
//! - GET /api/v1/sessions: registered sessions
//! - POST /api/v1/sessions: register a session
//! - GET /api/v1/sessions/:id: one session
//! - DELETE /api/v1/sessions/:id: deregister, cancelling in-flight work
//! - POST /api/v1/policy/reload: re-read and swap the traffic policy
//! - GET /api/v1/gateway/status: lifecycle state and counters
//! - GET /api/v1/ca: sandbox CA certificate (PEM)

use crate::command::{refspec::is_valid_ref_name, CommandRequest};
use crate::gateway::Gateway;
use axum::{
    extract::{ConnectInfo, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Create the dispatcher router. It must be served with connect info.
pub fn dispatcher_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/api/v1/command", post(run_command))
        .with_state(gateway)
}

/// Create the admin router
pub fn admin_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/api/v1/sessions", get(list_sessions).post(register_session))
        .route(
            "/api/v1/sessions/:id",
            get(get_session).delete(deregister_session),
        )
        .route("/api/v1/policy/reload", post(reload_policy))
        .route("/api/v1/gateway/status", get(gateway_status))
        .route("/api/v1/ca", get(ca_certificate))
        .with_state(gateway)
}

fn error_body(code: &str, message: impl Into<String>) -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": {"code": code, "message": message.into()}}))
}

/// POST /api/v1/command
///
/// A denial is a normal response: the verdict travels in the body and the
/// shim turns it into a non-zero exit. The caller is identified by the
/// address it connected from; the body's session id only selects which
/// session that address claims to be.
async fn run_command(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(mut request): Json<CommandRequest>,
) -> impl IntoResponse {
    request.peer = Some(peer.ip());
    Json(gateway.commands().handle(&request).await)
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    session_id: String,
    branch: String,
    #[serde(default)]
    source_addr: Option<IpAddr>,
}

/// POST /api/v1/sessions
async fn register_session(
    State(gateway): State<Arc<Gateway>>,
    Json(request): Json<RegisterRequest>,
) -> impl IntoResponse {
    if !is_valid_ref_name(&request.branch) {
        return (
            StatusCode::BAD_REQUEST,
            error_body(
                "INVALID_BRANCH",
                format!("'{}' is not a valid branch name", request.branch),
            ),
        )
            .into_response();
    }

    match gateway
        .sessions()
        .register(&request.session_id, &request.branch, request.source_addr)
        .await
    {
        Ok(session) => (StatusCode::CREATED, Json(session.info())).into_response(),
        Err(e) => (StatusCode::CONFLICT, error_body("CONFLICT", e.to_string())).into_response(),
    }
}

/// GET /api/v1/sessions
async fn list_sessions(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    let mut infos: Vec<_> = gateway
        .sessions()
        .list()
        .await
        .iter()
        .map(|s| s.info())
        .collect();
    infos.sort_by(|a, b| a.id.cmp(&b.id));
    Json(infos)
}

/// GET /api/v1/sessions/:id
async fn get_session(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match gateway.sessions().get(&id).await {
        Some(session) => (StatusCode::OK, Json(session.info())).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            error_body("NOT_FOUND", "Session not found"),
        )
            .into_response(),
    }
}

/// DELETE /api/v1/sessions/:id
async fn deregister_session(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match gateway.sessions().deregister(&id).await {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => (
            StatusCode::NOT_FOUND,
            error_body("NOT_FOUND", "Session not found"),
        )
            .into_response(),
    }
}

/// POST /api/v1/policy/reload
async fn reload_policy(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    match gateway.reload_policy().await {
        Ok(generation) => (
            StatusCode::OK,
            Json(serde_json::json!({"generation": generation})),
        ),
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            error_body("RELOAD_FAILED", e.to_string()),
        ),
    }
}

/// GET /api/v1/gateway/status
async fn gateway_status(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    Json(gateway.status().await)
}

/// GET /api/v1/ca
async fn ca_certificate(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/x-pem-file")],
        gateway.ca().cert_pem().to_string(),
    )
}
