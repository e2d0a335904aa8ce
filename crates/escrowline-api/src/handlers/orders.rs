use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use escrowline_settlement::{CreatedOrder, SettlementOutcome};
use escrowline_types::{
    DisputeTrigger, EscrowlineError, IdempotencyKey, NewOrder, Order, OrderFilter, OrderId,
    OrderItem, OrderStatus, UserId,
};
use serde::Deserialize;
use uuid::Uuid;

use super::{ApiResponse, ok, ok_with_message};
use crate::auth::Caller;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub seller_id: UserId,
    pub items: Vec<OrderItem>,
    pub shipping_address: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: OrderStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaiseDisputeRequest {
    pub reason: String,
    /// Defaults to the trigger matching the caller's role.
    #[serde(default)]
    pub trigger_type: Option<DisputeTrigger>,
}

#[derive(Debug, Deserialize)]
pub struct ReturnRequest {
    pub reason: String,
}

/// The `Idempotency-Key` header wins over a key in the body.
fn idempotency_key(headers: &HeaderMap, body_key: Option<&str>) -> ApiResult<Option<IdempotencyKey>> {
    let raw = match headers.get(IDEMPOTENCY_HEADER) {
        Some(value) => Some(value.to_str().map_err(|_| {
            ApiError(EscrowlineError::validation(
                "idempotency key must be visible ASCII",
            ))
        })?),
        None => body_key,
    };
    Ok(raw.map(IdempotencyKey::parse).transpose()?)
}

/// POST /orders
///
/// 201 for a new order, 200 with `idempotent: true` for a replay.
pub async fn create_order(
    State(state): State<AppState>,
    Caller(actor): Caller,
    headers: HeaderMap,
    payload: Result<Json<CreateOrderRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ApiResponse<CreatedOrder>>)> {
    let Json(req) = payload?;
    let key = idempotency_key(&headers, req.idempotency_key.as_deref())?;
    let new_order = NewOrder {
        seller_id: req.seller_id,
        items: req.items,
        shipping_address: req.shipping_address,
    };

    let created = state.engine.create_order(actor, new_order, key)?;
    let status = if created.idempotent {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, ok(created)))
}

/// GET /orders
pub async fn list_orders(
    State(state): State<AppState>,
    Caller(actor): Caller,
    query: Result<Query<OrderFilter>, QueryRejection>,
) -> ApiResult<Json<ApiResponse<Vec<Order>>>> {
    let Query(filter) = query?;
    Ok(ok(state.engine.list_orders(actor, &filter)))
}

/// GET /orders/:id
pub async fn get_order(
    State(state): State<AppState>,
    Caller(actor): Caller,
    path: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<ApiResponse<Order>>> {
    let Path(id) = path?;
    Ok(ok(state.engine.get_order(actor, OrderId(id))?))
}

/// PATCH /orders/:id/status
pub async fn update_order_status(
    State(state): State<AppState>,
    Caller(actor): Caller,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<UpdateStatusRequest>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<Order>>> {
    let Path(id) = path?;
    let Json(req) = payload?;
    let order = state
        .engine
        .update_status(actor, OrderId(id), req.status, req.reason)?;
    Ok(ok(order))
}

/// POST /orders/:id/dispute
pub async fn raise_dispute(
    State(state): State<AppState>,
    Caller(actor): Caller,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<RaiseDisputeRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ApiResponse<SettlementOutcome>>)> {
    let Path(id) = path?;
    let Json(req) = payload?;
    let trigger = req
        .trigger_type
        .unwrap_or_else(|| DisputeTrigger::for_buyer(actor.role));
    let outcome = state
        .engine
        .raise_dispute(actor, OrderId(id), &req.reason, trigger)?;
    Ok((
        StatusCode::CREATED,
        ok_with_message(outcome, "Dispute raised. Funds are frozen pending review."),
    ))
}

/// POST /orders/:id/return
pub async fn request_return(
    State(state): State<AppState>,
    Caller(actor): Caller,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<ReturnRequest>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<Order>>> {
    let Path(id) = path?;
    let Json(req) = payload?;
    Ok(ok(state.engine.request_return(actor, OrderId(id), &req.reason)?))
}
