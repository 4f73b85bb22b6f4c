//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use chaos_engine::ServiceError;

use crate::auth::AuthError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Service(e) => match e {
                ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
                ServiceError::InvalidTransition(_) | ServiceError::Conflict(_) => StatusCode::CONFLICT,
                ServiceError::Unauthorized(_) | ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
                ServiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Service(e) => e.kind(),
            Self::Auth(_) => "unauthenticated",
            Self::BadRequest(_) => "invalid_input",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Internal details stay in the log.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };
        let body = json!({
            "code": status.as_u16(),
            "error": self.code(),
            "message": message,
        });
        (status, Json(body)).into_response()
    }
}
