//! API routers for sandgate
//!
//! Two applications, each with request tracing: the dispatcher app that
//! sessions reach, and the admin app that only the orchestrator should.
//!
//! ## Dispatcher listener
//!
//! | Prefix                     | Module  | Description                          |
//! |----------------------------|---------|--------------------------------------|
//! | `/health`                  | api     | Liveness check                       |
//! | `/api/v1/command`          | gateway | Mediated git/gh execution            |
//!
//! ## Admin listener
//!
//! | Prefix                     | Module  | Description                          |
//! |----------------------------|---------|--------------------------------------|
//! | `/health`                  | api     | Liveness check                       |
//! | `/api/v1/sessions/*`       | gateway | Session registration                 |
//! | `/api/v1/policy/reload`    | gateway | Traffic policy hot reload            |
//! | `/api/v1/gateway/status`   | gateway | Lifecycle state and counters         |
//! | `/api/v1/ca`               | gateway | Sandbox CA certificate               |
//! | `/api/v1/audit/decisions`  | audit   | Recent decisions                     |

use crate::audit::{audit_router, AuditState};
use crate::gateway::{admin_router, dispatcher_router, Gateway};
use axum::{response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the dispatcher application
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()`:
/// the command route reads the caller's address.
pub fn build_app(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .merge(dispatcher_router(gateway))
        .layer(TraceLayer::new_for_http())
}

/// Build the admin application: session provisioning, policy reload,
/// status, the CA certificate and the decision log.
pub fn build_admin_app(gateway: Arc<Gateway>) -> Router {
    let audit_state = AuditState {
        log: gateway.log().clone(),
    };

    Router::new()
        .route("/health", get(health_check))
        .merge(admin_router(gateway))
        .merge(audit_router(audit_state))
        .layer(TraceLayer::new_for_http())
}

// =============================================================================
// Root handlers
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
