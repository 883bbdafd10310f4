//! HTTP error responses
//!
//! Every error leaves the service as
//! `{"error":{"type":"...","message":"...","request_id":"req_..."}}`.
//! `request_id` is omitted on admin responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// A request-level failure mapped to a status code and error type.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub error_type: &'static str,
    pub message: String,
    pub request_id: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, error_type: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error_type,
            message: message.into(),
            request_id: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid admin key",
        )
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl From<worker_pool::Error> for ApiError {
    fn from(err: worker_pool::Error) -> Self {
        use worker_pool::Error;

        let (status, error_type) = match &err {
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::InvalidCredential(_) => (StatusCode::BAD_REQUEST, "invalid_credential"),
            Error::InvalidUpdate(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Error::DuplicateAccount(_) => (StatusCode::CONFLICT, "duplicate_account"),
            Error::NoEligibleWorker { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "no_available_worker")
            }
            Error::RefreshFailed(_) => (StatusCode::BAD_GATEWAY, "refresh_failed"),
            Error::CreditsUnavailable(_) => (StatusCode::BAD_GATEWAY, "credits_unavailable"),
            Error::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
        };
        Self::new(status, error_type, err.to_string())
    }
}

impl From<upstream::UpstreamError> for ApiError {
    fn from(err: upstream::UpstreamError) -> Self {
        use upstream::UpstreamError;

        let (status, error_type) = match &err {
            UpstreamError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "upstream_timeout"),
            UpstreamError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            UpstreamError::InvalidCredential(_) => (StatusCode::BAD_GATEWAY, "credential_rejected"),
            _ => (StatusCode::BAD_GATEWAY, "upstream_error"),
        };
        Self::new(status, error_type, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = serde_json::json!({
            "type": self.error_type,
            "message": self.message,
        });
        if let Some(request_id) = self.request_id {
            error["request_id"] = serde_json::Value::String(request_id);
        }
        let body = serde_json::json!({ "error": error });
        (
            self.status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
