use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Every externally reachable failure maps to one of these stable codes.
/// The Display string is the wire-level code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("invalid_request")]
    InvalidRequest,
    #[error("invalid_rating")]
    InvalidRating,
    #[error("comment_too_long")]
    CommentTooLong,
    #[error("not_found")]
    NotFound,
    #[error("invalid_signature")]
    InvalidSignature,
    #[error("expired")]
    Expired,
    #[error("not_allowed")]
    NotAllowed,
    #[error("internal")]
    Internal,
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub ok: bool,
    pub error: String,
}

impl IntoResponse for ApiError {
    // Every failure, internal ones included, surfaces as a 400 with a
    // structured body; the HTTP layer never distinguishes them further.
    fn into_response(self) -> Response {
        let body = ErrorBody {
            ok: false,
            error: self.to_string(),
        };

        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }
}
