//! HTTP handlers for the decision audit API
//!
//! - GET /api/v1/audit/decisions: recent decisions, newest first
//!   (`session`, `verdict`, `limit`)

use super::log::{DecisionLog, DecisionQuery};
use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::sync::Arc;

const MAX_LIMIT: usize = 1000;

/// Shared state for audit handlers
#[derive(Clone)]
pub struct AuditState {
    pub log: Arc<DecisionLog>,
}

/// Create the audit router
pub fn audit_router(state: AuditState) -> Router {
    Router::new()
        .route("/api/v1/audit/decisions", get(list_decisions))
        .with_state(state)
}

/// GET /api/v1/audit/decisions
async fn list_decisions(
    State(state): State<AuditState>,
    Query(mut query): Query<DecisionQuery>,
) -> impl IntoResponse {
    query.limit = Some(query.limit.unwrap_or(50).min(MAX_LIMIT));
    Json(state.log.recent(&query).await)
}
