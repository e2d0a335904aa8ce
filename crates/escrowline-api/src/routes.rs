use axum::{
    Router,
    routing::{get, patch, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::{handlers, state::AppState};

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        // Orders
        .route("/orders", post(handlers::create_order).get(handlers::list_orders))
        .route("/orders/:id", get(handlers::get_order))
        .route("/orders/:id/status", patch(handlers::update_order_status))
        .route("/orders/:id/dispute", post(handlers::raise_dispute))
        .route("/orders/:id/return", post(handlers::request_return))
        // Escrow
        .route("/escrow/confirm-delivery", post(handlers::confirm_delivery))
        .route("/escrow/request-refund", post(handlers::request_refund))
        .route("/escrow/admin/release", post(handlers::admin_release))
        .route("/escrow/admin/refund", post(handlers::admin_refund))
        .route("/escrow/admin/all", get(handlers::list_escrows))
        .route("/escrow/auto-release", post(handlers::run_auto_release))
        .route("/escrow/:order_id", get(handlers::get_escrow))
        // Disputes
        .route("/disputes", get(handlers::list_disputes))
        .route("/disputes/:id", get(handlers::get_dispute))
        .route("/disputes/:id/resolve", post(handlers::resolve_dispute))
        // Audit
        .route("/admin/audit", get(handlers::query_audit))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
