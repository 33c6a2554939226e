use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use relay_core::session::SessionError;
use relay_core::RelayError;
use serde::Serialize;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, detail)
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }

    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        match e {
            // Denial reasons are logged by the core; clients only learn the class.
            RelayError::Unauthorized(_) => Self::forbidden(e.code()),
            RelayError::Conflict => Self::new(StatusCode::CONFLICT, e.code()),
            RelayError::Malformed(detail) => Self::bad_request(detail),
            RelayError::NotFound(what) => Self::not_found(format!("{what} not found")),
            RelayError::Transient(inner) => {
                tracing::error!(error = %inner, "store unavailable");
                Self::unavailable("store unavailable")
            }
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Invalid => Self::unauthorized("invalid credential"),
            SessionError::Expired => Self::unauthorized("credential expired"),
            SessionError::Signing => Self::internal("token signing failed"),
            SessionError::Store(inner) => RelayError::Transient(inner).into(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    detail: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = axum::Json(ErrorBody {
            detail: self.detail.as_str(),
        });
        (self.status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
