use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use escrowline_types::EscrowlineError;
use serde_json::json;
use tracing::{error, warn};

/// An engine error on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub EscrowlineError);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0.code() {
            "VALIDATION_ERROR" => StatusCode::BAD_REQUEST,
            "UNAUTHENTICATED" => StatusCode::UNAUTHORIZED,
            "FORBIDDEN" => StatusCode::FORBIDDEN,
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "CONFLICT" | "DISPUTE_EXISTS" | "ALREADY_RESOLVED" | "ESCROW_TERMINAL" => {
                StatusCode::CONFLICT
            }
            "INVALID_TRANSITION" => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<EscrowlineError> for ApiError {
    fn from(err: EscrowlineError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(EscrowlineError::validation(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self(EscrowlineError::validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(EscrowlineError::validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = self.0.code(), error = %self.0, "Request failed");
        } else {
            warn!(code = self.0.code(), error = %self.0, "Request rejected");
        }
        (
            status,
            Json(json!({
                "success": false,
                "error": {
                    "code": self.0.code(),
                    "message": self.0.to_string(),
                },
            })),
        )
            .into_response()
    }
}
