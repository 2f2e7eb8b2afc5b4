//! API error type.
//!
//! Maps encoder, attendance and registry errors onto HTTP status codes with a
//! JSON body `{"error": {"code", "message"}}`. Internal details are logged,
//! never returned.

use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::NaiveDateTime;
use roster_core::{AttendanceError, EncodeError, UserId};
use roster_store::StoreError;
use serde::Serialize;
use thiserror::Error;

use crate::engine::EngineError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("user is already registered: {0}")]
    AlreadyRegistered(String),
    #[error("attendance already marked today for {name} at {at}")]
    AlreadyMarkedToday { name: String, at: NaiveDateTime },
    #[error("no matching face found")]
    NoMatch,
    #[error("user {0} not found")]
    UserNotFound(UserId),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("upload too large")]
    PayloadTooLarge,
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::NoFaceDetected => (StatusCode::UNPROCESSABLE_ENTITY, "NO_FACE_DETECTED"),
            Self::InvalidImage(_) => (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_IMAGE"),
            Self::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR"),
            Self::AlreadyRegistered(_) => (StatusCode::CONFLICT, "ALREADY_REGISTERED"),
            Self::AlreadyMarkedToday { .. } => (StatusCode::CONFLICT, "ALREADY_MARKED_TODAY"),
            Self::NoMatch => (StatusCode::NOT_FOUND, "NO_MATCHING_FACE"),
            Self::UserNotFound(_) => (StatusCode::NOT_FOUND, "USER_NOT_FOUND"),
            Self::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            Self::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE"),
            Self::ServiceUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let message = match &self {
            Self::Internal(_) => "An internal error occurred".to_string(),
            other => other.to_string(),
        };

        match &self {
            Self::Internal(_) => tracing::error!(error = %self, "internal server error"),
            Self::ServiceUnavailable(_) => tracing::warn!(error = %self, "service unavailable"),
            _ => tracing::debug!(error = %self, code, "request rejected"),
        }

        let body = ErrorBody {
            error: ErrorDetail { code, message },
        };
        (status, Json(body)).into_response()
    }
}

impl From<EncodeError> for AppError {
    fn from(e: EncodeError) -> Self {
        match e {
            EncodeError::NoFaceDetected => Self::NoFaceDetected,
            EncodeError::Decode(msg) => Self::InvalidImage(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Encode(inner) => inner.into(),
            EngineError::Timeout(_) | EngineError::ChannelClosed => Self::ServiceUnavailable(e.to_string()),
            EngineError::Spawn(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<AttendanceError> for AppError {
    fn from(e: AttendanceError) -> Self {
        match e {
            AttendanceError::NoFaceDetected => Self::NoFaceDetected,
            AttendanceError::Decode(msg) => Self::InvalidImage(msg),
            AttendanceError::NoMatch { .. } => Self::NoMatch,
            AttendanceError::AlreadyMarkedToday { name, at, .. } => Self::AlreadyMarkedToday { name, at },
            AttendanceError::UserNotFound(id) => Self::UserNotFound(id),
            AttendanceError::Encoding(msg) | AttendanceError::Storage(msg) => Self::Internal(msg),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateEmail(email) => Self::AlreadyRegistered(email),
            StoreError::UserNotFound(id) => Self::UserNotFound(id),
            e if e.is_busy() => Self::ServiceUnavailable("registry busy, retry".into()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<MultipartError> for AppError {
    fn from(e: MultipartError) -> Self {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self::PayloadTooLarge
        } else {
            Self::Validation(e.body_text())
        }
    }
}
