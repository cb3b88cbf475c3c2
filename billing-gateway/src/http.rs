//! Maps [`AppError`](crate::error::AppError) onto HTTP status codes and response bodies.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::error::{AppError, ErrorKind};

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

fn status_for(kind: ErrorKind) -> (StatusCode, &'static str) {
    match kind {
        ErrorKind::Validation => (StatusCode::BAD_REQUEST, "validation_error"),
        ErrorKind::Auth => (StatusCode::UNAUTHORIZED, "auth_error"),
        ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
        ErrorKind::Conflict => (StatusCode::CONFLICT, "conflict"),
        ErrorKind::TransientStore => (StatusCode::SERVICE_UNAVAILABLE, "transient_store"),
        ErrorKind::TransientTransport => (StatusCode::BAD_GATEWAY, "transient_transport"),
        ErrorKind::PermanentBusinessRule => (StatusCode::UNPROCESSABLE_ENTITY, "business_rule"),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = status_for(self.kind);

        if status.is_server_error() {
            error!(kind = ?self.kind, error = %self, "request failed");
        } else {
            tracing::debug!(kind = ?self.kind, error = %self, "request rejected");
        }

        let body = ErrorBody { error: code, message: self.source.to_string() };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn not_found_maps_to_404() {
        let err = AppError::not_found("license xyz does not exist");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["error"], "not_found");
    }

    #[tokio::test]
    async fn transient_store_maps_to_503() {
        let err = AppError::transient_store(anyhow::anyhow!("connection reset"));
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
