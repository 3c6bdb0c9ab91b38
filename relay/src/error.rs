//! `RelayError` maps the core error taxonomy onto the exact HTTP
//! status/body shapes required by the wire surface: `400
//! {error, details}` for validation and gate rejections, `401` for auth
//! failures, `404` for missing resources, `409` for uniqueness conflicts.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cipherlink_core::error::CoreError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("not authenticated")]
    Unauthorized,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("username already registered")]
    UsernameTaken,
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    BadRequest(String),
    #[error("missing-replay-fields")]
    MissingReplayFields,
    #[error("message-from-future")]
    MessageFromFuture,
    #[error("message-too-old")]
    MessageTooOld,
    #[error("duplicate-nonce")]
    DuplicateNonce,
    #[error("invalid-sequence-number")]
    InvalidSequence,
    #[error("invalid-self-response")]
    InvalidSelfResponse,
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<CoreError> for RelayError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound => RelayError::NotFound,
            CoreError::MissingReplayFields => RelayError::MissingReplayFields,
            CoreError::BadNonce => RelayError::BadRequest("bad-nonce".into()),
            CoreError::DuplicateNonce | CoreError::StorageUniquenessViolation => RelayError::DuplicateNonce,
            CoreError::MessageTooOld => RelayError::MessageTooOld,
            CoreError::MessageFromFuture => RelayError::MessageFromFuture,
            CoreError::InvalidSequence => RelayError::InvalidSequence,
            CoreError::WrongPasswordOrCorrupt => RelayError::InvalidCredentials,
            other => RelayError::Internal(other.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    details: String,
}

impl RelayError {
    fn code(&self) -> &'static str {
        match self {
            RelayError::Unauthorized => "unauthorized",
            RelayError::InvalidCredentials => "invalid-credentials",
            RelayError::UsernameTaken => "username-taken",
            RelayError::NotFound => "not-found",
            RelayError::BadRequest(_) => "bad-request",
            RelayError::MissingReplayFields => "missing-replay-fields",
            RelayError::MessageFromFuture => "message-from-future",
            RelayError::MessageTooOld => "message-too-old",
            RelayError::DuplicateNonce => "duplicate-nonce",
            RelayError::InvalidSequence => "invalid-sequence-number",
            RelayError::InvalidSelfResponse => "invalid-self-response",
            RelayError::Internal(_) => "internal-error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            RelayError::Unauthorized => StatusCode::UNAUTHORIZED,
            RelayError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            RelayError::UsernameTaken => StatusCode::CONFLICT,
            RelayError::NotFound => StatusCode::NOT_FOUND,
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.code(),
            details: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
