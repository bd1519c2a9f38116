use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

use crate::{auth::AuthError, model::ValidationError, store::StorageError, sync::SyncError};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    fn status(&self) -> StatusCode {
        if let Some(e) = self.0.downcast_ref::<SyncError>() {
            return match e {
                SyncError::Validation(_) => StatusCode::BAD_REQUEST,
                SyncError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
                SyncError::NotParticipant { .. } => StatusCode::FORBIDDEN,
                SyncError::Aborted(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
        }
        if self.0.is::<ValidationError>() || self.0.is::<JsonRejection>() {
            return StatusCode::BAD_REQUEST;
        }
        if let Some(e) = self.0.downcast_ref::<AuthError>() {
            return match e {
                AuthError::Session(_) | AuthError::Secret => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::UNAUTHORIZED,
            };
        }
        if self.0.is::<StorageError>() || self.0.is::<sqlx::Error>() {
            return StatusCode::SERVICE_UNAVAILABLE;
        }
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("{}\n\n{}", self.0, self.0.backtrace());
        }

        let body = match status {
            StatusCode::SERVICE_UNAVAILABLE => json!({ "error": self.0.to_string(), "retryable": true }),
            StatusCode::INTERNAL_SERVER_ERROR => json!({ "error": "internal server error" }),
            _ => json!({ "error": self.0.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
