use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use escrowline_settlement::SettlementOutcome;
use escrowline_types::{Dispute, DisputeId, DisputeStatus, Resolution};
use serde::Deserialize;
use uuid::Uuid;

use super::{ApiResponse, ok};
use crate::auth::Caller;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DisputeListQuery {
    pub status: Option<DisputeStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveDisputeRequest {
    pub resolution: Resolution,
    #[serde(default)]
    pub admin_notes: Option<String>,
}

/// GET /disputes
pub async fn list_disputes(
    State(state): State<AppState>,
    Caller(actor): Caller,
    query: Result<Query<DisputeListQuery>, QueryRejection>,
) -> ApiResult<Json<ApiResponse<Vec<Dispute>>>> {
    let Query(query) = query?;
    Ok(ok(state.engine.list_disputes(actor, query.status)?))
}

/// GET /disputes/:id
pub async fn get_dispute(
    State(state): State<AppState>,
    Caller(actor): Caller,
    path: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<ApiResponse<Dispute>>> {
    let Path(id) = path?;
    Ok(ok(state.engine.get_dispute(actor, DisputeId(id))?))
}

/// POST /disputes/:id/resolve
pub async fn resolve_dispute(
    State(state): State<AppState>,
    Caller(actor): Caller,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<ResolveDisputeRequest>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<SettlementOutcome>>> {
    let Path(id) = path?;
    let Json(req) = payload?;
    let outcome = state
        .engine
        .resolve_dispute(actor, DisputeId(id), req.resolution, req.admin_notes)?;
    Ok(ok(outcome))
}
