//! The error envelope.
//!
//! Every failing handler funnels through [`ApiError`], which renders
//! the `{ "error": { code, message, normalizedError, details } }`
//! envelope plus a `Retry-After` header when the failure is a
//! throttle.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use stevedore_engine::EngineError;
use stevedore_protocol::error::{ApiErrorBody, ErrorEnvelope, NormalizedError, NormalizedErrorCode};
use stevedore_protocol::types::ValidationError;
use stevedore_scheduler::manager::DeleteJobError;
use stevedore_scheduler::SubmitError;
use stevedore_store::StoreError;
use stevedore_uploads::UploadError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub normalized: NormalizedErrorCode,
    pub details: serde_json::Value,
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        normalized: NormalizedErrorCode,
    ) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            normalized,
            details: serde_json::Value::Null,
            retry_after_secs: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "validation_error",
            message,
            NormalizedErrorCode::ValidationError,
        )
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "not_found",
            message,
            NormalizedErrorCode::NotFound,
        )
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            error: ApiErrorBody {
                code: self.code.to_string(),
                message: self.message,
                normalized_error: NormalizedError::from(self.normalized),
                details: self.details,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::validation(e.message)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ApiError::not_found(what),
            other => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "db_error",
                other.to_string(),
                NormalizedErrorCode::Unknown,
            ),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match &e {
            EngineError::Missing(_) => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "transfer_engine_missing",
                e.to_string(),
                NormalizedErrorCode::TransferEngineMissing,
            ),
            EngineError::Incompatible { .. } => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "transfer_engine_incompatible",
                e.to_string(),
                NormalizedErrorCode::TransferEngineIncompatible,
            ),
            _ => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "engine_error",
                e.to_string(),
                NormalizedErrorCode::Unknown,
            ),
        }
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::Validation(v) => v.into(),
            SubmitError::QueueFull {
                queue_depth,
                queue_capacity,
                retry_after_secs,
            } => {
                let mut err = ApiError::new(
                    StatusCode::TOO_MANY_REQUESTS,
                    "job_queue_full",
                    "the job queue is full; retry later",
                    NormalizedErrorCode::RateLimited,
                )
                .with_details(serde_json::json!({
                    "queueDepth": queue_depth,
                    "queueCapacity": queue_capacity,
                }));
                err.retry_after_secs = Some(retry_after_secs);
                err
            }
            SubmitError::Engine(e) => e.into(),
            SubmitError::Store(e) => e.into(),
        }
    }
}

impl From<DeleteJobError> for ApiError {
    fn from(e: DeleteJobError) -> Self {
        match e {
            DeleteJobError::Running => ApiError::new(
                StatusCode::CONFLICT,
                "job_running",
                "job is running; cancel it first",
                NormalizedErrorCode::Conflict,
            ),
            DeleteJobError::Store(e) => e.into(),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(e: UploadError) -> Self {
        match e {
            UploadError::Store(e) => e.into(),
            UploadError::Engine(e) => e.into(),
            UploadError::CapabilityDenied { .. } => ApiError::validation(e.to_string()),
            UploadError::BudgetExceeded => ApiError::validation(e.to_string()),
            UploadError::InvalidPath(_) => ApiError::validation(e.to_string()),
            UploadError::WrongMode => ApiError::validation(e.to_string()),
            UploadError::Expired => ApiError::new(
                StatusCode::GONE,
                "upload_expired",
                e.to_string(),
                NormalizedErrorCode::ValidationError,
            ),
            UploadError::AlreadyCommitted => ApiError::new(
                StatusCode::CONFLICT,
                "upload_committed",
                e.to_string(),
                NormalizedErrorCode::Conflict,
            ),
            UploadError::Provider(_) => ApiError::new(
                StatusCode::BAD_GATEWAY,
                "provider_error",
                e.to_string(),
                NormalizedErrorCode::Unknown,
            ),
            UploadError::Io(e) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "io_error",
                e.to_string(),
                NormalizedErrorCode::Unknown,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_full_carries_retry_after_and_details() {
        let err: ApiError = SubmitError::QueueFull {
            queue_depth: 2,
            queue_capacity: 2,
            retry_after_secs: 3,
        }
        .into();
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.code, "job_queue_full");
        assert_eq!(err.retry_after_secs, Some(3));
        assert_eq!(err.details["queueDepth"], 2);
        assert_eq!(err.details["queueCapacity"], 2);

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("Retry-After").unwrap(),
            &HeaderValue::from_static("3")
        );
    }

    #[test]
    fn store_not_found_maps_to_404() {
        let err: ApiError = StoreError::NotFound("job 01H".to_string()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.normalized, NormalizedErrorCode::NotFound);
    }
}
