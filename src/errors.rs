use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;

/// Error structure returned to HTTP callers.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "Conflict",
    "message": "Reservation slot already booked: product 550e8400-e29b-41d4-a716-446655440000 on 2024-06-01 at 14:00",
    "details": null,
    "timestamp": "2024-12-09T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Additional error details (validation errors in dev mode)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// ISO 8601 timestamp when the error occurred
    pub timestamp: String,
}

/// Failure converting a paid payment session into committed orders.
///
/// These carry an explicit HTTP-equivalent status per cause and are never
/// swallowed: both the client completion endpoint and the webhook surface
/// propagate them to the caller so the trigger's own retry policy applies.
#[derive(Debug, Clone, thiserror::Error, Serialize)]
pub enum CheckoutFinalizationError {
    #[error("payment session metadata names no owner")]
    MissingOwner,

    #[error("payment session belongs to another customer")]
    OwnershipMismatch,

    #[error("payment session is not paid (status: {0})")]
    NotPaid(String),

    #[error("no complete shipping address resolvable from payment session")]
    MissingShippingAddress,

    #[error("payment session has no purchasable line items")]
    EmptySession,
}

impl CheckoutFinalizationError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::OwnershipMismatch => StatusCode::FORBIDDEN,
            Self::MissingOwner
            | Self::NotPaid(_)
            | Self::MissingShippingAddress
            | Self::EmptySession => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("Checkout finalization failed: {0}")]
    CheckoutFinalization(#[from] CheckoutFinalizationError),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::DatabaseError(error.into_db_err())
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::InvalidOperation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::InsufficientStock(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::CheckoutFinalization(cause) => cause.status_code(),
            Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            Self::EventError(_) | Self::InternalError(_) | Self::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::EventError(_) | Self::InternalError(_) | Self::Other(_) => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalization_causes_carry_their_http_status() {
        assert_eq!(
            CheckoutFinalizationError::MissingOwner.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            CheckoutFinalizationError::OwnershipMismatch.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            CheckoutFinalizationError::NotPaid("unpaid".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            CheckoutFinalizationError::EmptySession.status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn service_error_wraps_finalization_status() {
        let err: ServiceError = CheckoutFinalizationError::OwnershipMismatch.into();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn internal_errors_hide_details_from_responses() {
        let err = ServiceError::db_error("connection reset");
        assert_eq!(err.response_message(), "Database error");
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
