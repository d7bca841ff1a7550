use axum::{
    Json,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::ports::RepositoryError;
use crate::services::{AccountError, TransferError};
use crate::validation::ValidationError;

/// Seconds a client should wait before retrying a busy or in-flight request.
pub const RETRY_AFTER_SECS: u64 = 1;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Insufficient funds")]
    InsufficientFunds,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Gone: {0}")]
    Gone(String),

    #[error("Busy: {0}")]
    Busy(String),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Gone(_) => StatusCode::GONE,
            AppError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        match self {
            AppError::Busy(_) => (
                status,
                [(header::RETRY_AFTER, RETRY_AFTER_SECS.to_string())],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::Validation(err.to_string())
    }
}

impl From<RepositoryError> for AppError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(what) => AppError::NotFound(what),
            RepositoryError::InsufficientFunds(_) => AppError::InsufficientFunds,
            RepositoryError::Conflict(what) => AppError::Conflict(what),
            RepositoryError::ClaimExpired(_) => AppError::Gone("claim token has expired".to_string()),
            RepositoryError::Busy => AppError::Busy("row lock not acquired in time".to_string()),
            RepositoryError::Corrupt(what) => AppError::Internal(what),
            RepositoryError::Database(e) => AppError::DatabaseError(e.to_string()),
        }
    }
}

impl From<TransferError> for AppError {
    fn from(err: TransferError) -> Self {
        let message = err.to_string();
        match err {
            TransferError::Validation(_)
            | TransferError::InvalidAmount(_)
            | TransferError::RecipientUnresolved
            | TransferError::RecipientAmbiguous(_)
            | TransferError::SelfTransfer => AppError::Validation(message),
            TransferError::SenderNotFound | TransferError::RecipientNotFound(_) | TransferError::ClaimNotFound => {
                AppError::NotFound(message)
            }
            TransferError::Forbidden => AppError::Forbidden(message),
            TransferError::InsufficientFunds => AppError::InsufficientFunds,
            TransferError::ClaimAlreadyUsed => AppError::Conflict(message),
            TransferError::ClaimExpired => AppError::Gone(message),
            TransferError::Busy => AppError::Busy(message),
            TransferError::Store(e) => e.into(),
            TransferError::Interrupted(_) => AppError::Internal(message),
        }
    }
}

impl From<AccountError> for AppError {
    fn from(err: AccountError) -> Self {
        let message = err.to_string();
        match err {
            AccountError::Validation(_) | AccountError::InvalidAmount(_) => AppError::Validation(message),
            AccountError::EmailTaken => AppError::Conflict(message),
            AccountError::NotFound(_) => AppError::NotFound(message),
            AccountError::Forbidden => AppError::Forbidden(message),
            AccountError::Busy => AppError::Busy(message),
            AccountError::Store(e) => e.into(),
        }
    }
}
