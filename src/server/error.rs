//! Translation of errors into HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use streamgate_common::Error;

/// Handler error. Every request failure ends here, never in a panic.
#[derive(Debug)]
pub struct AppError(pub Error);

impl<E> From<E> for AppError
where
    E: Into<Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// JSON error body. Carries no URLs, tokens, key bytes or paths.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status =
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::BAD_GATEWAY);

        if status.is_server_error() {
            tracing::warn!(status = %status.as_u16(), error = %err, "Request failed");
        } else {
            tracing::debug!(status = %status.as_u16(), error = %err, "Request rejected");
        }

        let body = ErrorBody {
            error: err.code(),
            message: err.public_message(),
        };
        (status, Json(body)).into_response()
    }
}
