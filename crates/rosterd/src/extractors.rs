//! Rejection mapping for axum extractors.
//!
//! Handlers take `Result<Extractor, Rejection>` and pass it through one of
//! these helpers so malformed input gets the JSON error body instead of
//! axum's plain-text 400.

use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Multipart, Path, Query};
use axum::Json;

use crate::error::AppError;

pub fn extract_json<T>(result: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    result
        .map(|Json(v)| v)
        .map_err(|err| AppError::Validation(err.body_text()))
}

pub fn extract_path<T>(result: Result<Path<T>, PathRejection>) -> Result<T, AppError> {
    result
        .map(|Path(v)| v)
        .map_err(|err| AppError::Validation(err.body_text()))
}

pub fn extract_query<T>(result: Result<Query<T>, QueryRejection>) -> Result<T, AppError> {
    result
        .map(|Query(v)| v)
        .map_err(|err| AppError::Validation(err.body_text()))
}

pub fn extract_multipart(result: Result<Multipart, MultipartRejection>) -> Result<Multipart, AppError> {
    result.map_err(|err| AppError::Validation(err.body_text()))
}
