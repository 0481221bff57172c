use crate::domain::error::{PipelineError, VerificationError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Everything the webhook endpoint can fail with, mapped to HTTP.
///
/// Verification failures are the only 4xx; anything the provider should
/// redeliver is a 5xx.
#[derive(Debug)]
pub enum ApiError {
    Verification(VerificationError),
    Pipeline(PipelineError),
    UnknownProvider(String),
    /// The request budget ran out; the Supervisor owns the event now.
    Timeout,
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self::Pipeline(err)
    }
}

impl From<VerificationError> for ApiError {
    fn from(err: VerificationError) -> Self {
        Self::Verification(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            ApiError::UnknownProvider(name) => (
                StatusCode::NOT_FOUND,
                "unknown_provider",
                format!("no webhook endpoint for {name}"),
            ),
            ApiError::Verification(err @ VerificationError::ProviderNotConfigured(_)) => {
                (StatusCode::NOT_FOUND, err.reason(), err.to_string())
            }
            ApiError::Verification(err @ VerificationError::Malformed(_)) => {
                (StatusCode::BAD_REQUEST, err.reason(), err.to_string())
            }
            // Never echo which part of the signature check failed.
            ApiError::Verification(err) => (
                StatusCode::UNAUTHORIZED,
                err.reason(),
                "signature verification failed".to_string(),
            ),
            ApiError::Timeout => (
                StatusCode::SERVICE_UNAVAILABLE,
                "timeout",
                "processing did not finish in time".to_string(),
            ),
            // Payload problems surface as `Malformed`; a validation error
            // here comes from stored state and the row stays `processing`.
            ApiError::Pipeline(
                err @ (PipelineError::Contention { .. }
                | PipelineError::OrderNotFound(_)
                | PipelineError::Storage(_)
                | PipelineError::Validation(_)),
            ) => {
                tracing::warn!("transient pipeline error: {err}");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "retry_later",
                    "temporarily unavailable".to_string(),
                )
            }
            ApiError::Pipeline(err) => {
                tracing::error!("pipeline error: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal error".to_string(),
                )
            }
        };

        let body = serde_json::json!({
            "error_code": error_code,
            "message": message,
        });

        (status, Json(body)).into_response()
    }
}
