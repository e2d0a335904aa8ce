use axum::Json;
use axum::extract::State;
use escrowline_types::constants;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub engine: &'static str,
    pub version: &'static str,
    /// Audit entries waiting for redelivery to the sink.
    pub audit_backlog: usize,
    /// Part of the backlog that exhausted its scheduled retries.
    pub audit_dead_letters: usize,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let audit_backlog = state.engine.audit_backlog();
    Json(HealthResponse {
        status: if audit_backlog == 0 { "ok" } else { "degraded" },
        engine: constants::ENGINE_NAME,
        version: constants::VERSION,
        audit_backlog,
        audit_dead_letters: state.engine.audit_dead_letters(),
    })
}
