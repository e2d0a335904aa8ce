mod audit;
mod disputes;
mod escrow;
mod orders;
mod system;

pub use audit::*;
pub use disputes::*;
pub use escrow::*;
pub use orders::*;
pub use system::*;

use axum::Json;
use serde::Serialize;

/// Standard success envelope: `{"success": true, "data": ...}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<PageMeta>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PageMeta {
    pub page: usize,
    pub limit: usize,
    pub total: usize,
}

pub(crate) fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data,
        message: None,
        meta: None,
    })
}

pub(crate) fn ok_with_message<T: Serialize>(data: T, message: &'static str) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data,
        message: Some(message),
        meta: None,
    })
}
