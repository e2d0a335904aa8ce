use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use escrowline_types::{AuditLogEntry, AuditQuery};

use super::{ApiResponse, ok};
use crate::auth::Caller;
use crate::error::ApiResult;
use crate::state::AppState;

/// GET /admin/audit
pub async fn query_audit(
    State(state): State<AppState>,
    Caller(actor): Caller,
    query: Result<Query<AuditQuery>, QueryRejection>,
) -> ApiResult<Json<ApiResponse<Vec<AuditLogEntry>>>> {
    let Query(query) = query?;
    Ok(ok(state.engine.audit_query(actor, &query)?))
}
