use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use escrowline_settlement::{AutoReleaseReport, SettlementOutcome};
use escrowline_types::{Escrow, EscrowStatus, OrderId};
use serde::Deserialize;
use uuid::Uuid;

use super::{ApiResponse, PageMeta, ok, ok_with_message};
use crate::auth::Caller;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmDeliveryRequest {
    pub order_id: OrderId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequest {
    pub order_id: OrderId,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminReleaseRequest {
    pub order_id: OrderId,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EscrowListQuery {
    pub status: Option<EscrowStatus>,
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

/// GET /escrow/:order_id
pub async fn get_escrow(
    State(state): State<AppState>,
    Caller(actor): Caller,
    path: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<ApiResponse<Escrow>>> {
    let Path(id) = path?;
    Ok(ok(state.engine.get_escrow(actor, OrderId(id))?))
}

/// POST /escrow/confirm-delivery
pub async fn confirm_delivery(
    State(state): State<AppState>,
    Caller(actor): Caller,
    payload: Result<Json<ConfirmDeliveryRequest>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<SettlementOutcome>>> {
    let Json(req) = payload?;
    let outcome = state.engine.confirm_delivery(actor, req.order_id)?;
    Ok(ok_with_message(
        outcome,
        "Delivery confirmed. Funds released to seller.",
    ))
}

/// POST /escrow/request-refund
pub async fn request_refund(
    State(state): State<AppState>,
    Caller(actor): Caller,
    payload: Result<Json<RefundRequest>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<SettlementOutcome>>> {
    let Json(req) = payload?;
    let outcome = state
        .engine
        .request_refund(actor, req.order_id, &req.reason)?;
    Ok(ok_with_message(
        outcome,
        "Refund request submitted for admin review.",
    ))
}

/// POST /escrow/admin/release
pub async fn admin_release(
    State(state): State<AppState>,
    Caller(actor): Caller,
    payload: Result<Json<AdminReleaseRequest>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<SettlementOutcome>>> {
    let Json(req) = payload?;
    let outcome = state.engine.admin_release(actor, req.order_id, req.notes)?;
    Ok(ok_with_message(outcome, "Funds released to seller."))
}

/// POST /escrow/admin/refund
pub async fn admin_refund(
    State(state): State<AppState>,
    Caller(actor): Caller,
    payload: Result<Json<RefundRequest>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<SettlementOutcome>>> {
    let Json(req) = payload?;
    let outcome = state
        .engine
        .admin_refund(actor, req.order_id, &req.reason)?;
    Ok(ok_with_message(outcome, "Funds refunded to buyer."))
}

/// GET /escrow/admin/all
pub async fn list_escrows(
    State(state): State<AppState>,
    Caller(actor): Caller,
    query: Result<Query<EscrowListQuery>, QueryRejection>,
) -> ApiResult<Json<ApiResponse<Vec<Escrow>>>> {
    let Query(query) = query?;
    let page = state
        .engine
        .list_escrows(actor, query.status, query.page, query.limit)?;
    Ok(Json(ApiResponse {
        success: true,
        meta: Some(PageMeta {
            page: page.page,
            limit: page.limit,
            total: page.total,
        }),
        data: page.items,
        message: None,
    }))
}

/// POST /escrow/auto-release
pub async fn run_auto_release(
    State(state): State<AppState>,
    Caller(actor): Caller,
) -> ApiResult<Json<ApiResponse<AutoReleaseReport>>> {
    Ok(ok(state.engine.run_auto_release(actor)?))
}
