//! Maps engine errors onto the HTTP error body shape from §7: every
//! non-2xx response carries `{error_kind, message}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dlman_core::DlmanError;
use serde::Serialize;

#[derive(Serialize)]
struct ErrorBody {
    error_kind: &'static str,
    message: String,
}

pub struct ApiError(pub DlmanError);

impl From<DlmanError> for ApiError {
    fn from(err: DlmanError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            error_kind: self.0.error_kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
