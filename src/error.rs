use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::{backend::BackendError, services::mail::MailError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Mail(#[from] MailError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
    #[error("{0}")]
    BadRequest(String),
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Backend(BackendError::NotFound) | AppError::NotFound => {
                StatusCode::NOT_FOUND
            }
            AppError::Backend(BackendError::InvalidCredentials) | AppError::Unauthorized => {
                StatusCode::UNAUTHORIZED
            }
            AppError::Backend(BackendError::Conflict(_)) | AppError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::Config(_)
            | AppError::Io(_)
            | AppError::Backend(_)
            | AppError::Mail(_)
            | AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("request failed: {self}");
        }
        (status, self.to_string()).into_response()
    }
}

/// JSON flavour of [`AppError`] for `/api` routes: `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError(pub AppError);

impl<E> From<E> for ApiError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status();
        if status.is_server_error() {
            error!("api request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_by_variant() {
        let cases = [
            (AppError::NotFound, StatusCode::NOT_FOUND),
            (AppError::Backend(BackendError::NotFound), StatusCode::NOT_FOUND),
            (AppError::Unauthorized, StatusCode::UNAUTHORIZED),
            (
                AppError::Backend(BackendError::InvalidCredentials),
                StatusCode::UNAUTHORIZED,
            ),
            (AppError::Forbidden, StatusCode::FORBIDDEN),
            (AppError::BadRequest("nope".into()), StatusCode::BAD_REQUEST),
            (
                AppError::Backend(BackendError::Conflict("taken".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                AppError::Config("missing".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                AppError::Backend(BackendError::Hash("salt".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                AppError::Other(anyhow::anyhow!("boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.status(), expected, "{err}");
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn api_errors_render_json() {
        let response = ApiError(AppError::Forbidden).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers()[axum::http::header::CONTENT_TYPE],
            "application/json"
        );
    }
}
