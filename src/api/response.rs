//! Response envelope and the single error-to-HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::domain::errors::EngineError;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            message: None,
        })
    }
}

/// Result alias used by every handler.
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Wrapper turning an [`EngineError`] into the HTTP envelope exactly once.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            EngineError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            EngineError::Forbidden(_) => StatusCode::FORBIDDEN,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::PreconditionFailed(_)
            | EngineError::InsufficientMargin { .. }
            | EngineError::InvalidLeverage { .. }
            | EngineError::ChallengeTerminal(_)
            | EngineError::InvalidTpSl(_)
            | EngineError::SymbolUnknown(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::PriceUnavailable(_) | EngineError::Unavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            EngineError::Database(_) | EngineError::Internal(_) => {
                tracing::error!("internal error: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        // Internal detail stays in the logs, not the response body.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "internal error".to_string()
        } else {
            self.0.to_string()
        };

        let body: ApiResponse<()> = ApiResponse {
            success: false,
            data: None,
            message: Some(message),
        };
        (status, Json(body)).into_response()
    }
}
