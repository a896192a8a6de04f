//! # Error Handling
//!
//! HTTP-facing error type and the mapping from every domain error onto it.
//!
//! ## Layers:
//! - **Domain errors** (`DetectionError`, `ClassifierError`, `FrameCodecError`, ...) are
//!   `thiserror` enums owned by the module that produces them
//! - **AppError** is what handlers return; the `From` impls below decide the
//!   HTTP status each domain failure maps to
//! - **anyhow** is only used at startup, before there is a request to answer
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "not_found",
//!     "message": "session '1a2b3c4d' not found",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use crate::audio::buffer::BufferError;
use crate::audio::classifier::ClassifierError;
use crate::audio::processor::AudioFormatError;
use crate::pipeline::PipelineError;
use crate::session::manager::SessionError;
use crate::vision::codec::FrameCodecError;
use crate::vision::detector::DetectionError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Errors a handler can return.
///
/// ## Status Mapping:
/// - **Internal / ConfigError** → 500
/// - **BadRequest / ValidationError** → 400
/// - **NotFound** → 404
/// - **Conflict** → 409 (pipeline already running, duplicate session id)
/// - **ServiceUnavailable** → 503 (no capture device, session limit, model missing)
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();
        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Malformed JSON is the client's fault, so it maps to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(_) => AppError::NotFound(err.to_string()),
            SessionError::AlreadyExists(_) => AppError::Conflict(err.to_string()),
            SessionError::LimitReached(_) => AppError::ServiceUnavailable(err.to_string()),
        }
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::DeviceUnavailable(_) => AppError::ServiceUnavailable(err.to_string()),
            PipelineError::AlreadyRunning => AppError::Conflict(err.to_string()),
            PipelineError::Spawn(_) => AppError::Internal(err.to_string()),
        }
    }
}

impl From<FrameCodecError> for AppError {
    fn from(err: FrameCodecError) -> Self {
        match err {
            FrameCodecError::Encode(_) => AppError::Internal(err.to_string()),
            _ => AppError::BadRequest(err.to_string()),
        }
    }
}

impl From<AudioFormatError> for AppError {
    fn from(err: AudioFormatError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<DetectionError> for AppError {
    fn from(err: DetectionError) -> Self {
        match err {
            DetectionError::ModelUnavailable(_) | DetectionError::Timeout { .. } => {
                AppError::ServiceUnavailable(err.to_string())
            }
            _ => AppError::Internal(err.to_string()),
        }
    }
}

impl From<ClassifierError> for AppError {
    fn from(err: ClassifierError) -> Self {
        match err {
            ClassifierError::Load(_) | ClassifierError::Timeout(_) | ClassifierError::Unavailable(_) => {
                AppError::ServiceUnavailable(err.to_string())
            }
            _ => AppError::Internal(err.to_string()),
        }
    }
}

impl From<BufferError> for AppError {
    fn from(err: BufferError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[actix_web::test]
    async fn test_error_body_shape() {
        let response = AppError::NotFound("session 'x' not found".into()).error_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "not_found");
        assert_eq!(json["error"]["message"], "session 'x' not found");
        assert!(json["error"]["timestamp"].is_string());
    }

    #[test]
    fn test_domain_error_mapping() {
        let status = |e: AppError| e.status_code();
        assert_eq!(status(SessionError::LimitReached(3).into()), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status(SessionError::AlreadyExists("a".into()).into()), StatusCode::CONFLICT);
        assert_eq!(status(PipelineError::AlreadyRunning.into()), StatusCode::CONFLICT);
        assert_eq!(
            status(PipelineError::DeviceUnavailable("camera 0".into()).into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status(FrameCodecError::Empty.into()), StatusCode::BAD_REQUEST);
        assert_eq!(status(AudioFormatError::Empty.into()), StatusCode::BAD_REQUEST);
    }
}
