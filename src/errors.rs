use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::DbErr;
use serde_json::json;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

/// Error taxonomy shared by all four services.
///
/// Business-rule errors roll back the enclosing transaction and surface to
/// the caller; infrastructure errors on the publish path never fail a
/// business write (the outbox row simply stays pending).
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("insufficient stock for product {0}")]
    InsufficientStock(Uuid),

    #[error("product {0} not found")]
    ProductNotFound(Uuid),

    #[error("product {0} does not belong to the requested store")]
    StoreMismatch(Uuid),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] DbErr),

    #[error("broker unavailable: {0}")]
    Broker(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Domain failures reject the operation outright; retrying with the same
    /// inputs cannot succeed. The reservation saga turns these into a failure
    /// reply instead of a nack.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            ServiceError::Validation(_)
                | ServiceError::InvalidState(_)
                | ServiceError::InsufficientStock(_)
                | ServiceError::ProductNotFound(_)
                | ServiceError::StoreMismatch(_)
        )
    }

    fn code(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "VALIDATION",
            ServiceError::Unauthorized(_) => "UNAUTHORIZED",
            ServiceError::Forbidden(_) => "FORBIDDEN",
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::InvalidState(_) => "INVALID_STATE",
            ServiceError::InsufficientStock(_) => "INSUFFICIENT_STOCK",
            ServiceError::ProductNotFound(_) => "PRODUCT_NOT_FOUND",
            ServiceError::StoreMismatch(_) => "STORE_MISMATCH",
            ServiceError::Conflict(_) => "CONFLICT",
            ServiceError::Database(_) => "DATABASE",
            ServiceError::Broker(_) => "BROKER_UNAVAILABLE",
            ServiceError::Serialization(_) => "SERIALIZATION",
            ServiceError::Internal(_) => "INTERNAL",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_)
            | ServiceError::InvalidState(_)
            | ServiceError::StoreMismatch(_) => StatusCode::BAD_REQUEST,
            ServiceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServiceError::NotFound(_) | ServiceError::ProductNotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::InsufficientStock(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::Broker(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Database(_)
            | ServiceError::Serialization(_)
            | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let body = Json(json!({
            "code": self.code(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
