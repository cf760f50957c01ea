use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use shared::ErrorResponse;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("inventory not found for product {0}")]
    NotFound(uuid::Uuid),

    #[error("business rule violation: {0}")]
    BusinessRuleViolation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("insufficient inventory: requested {requested}, available {available}")]
    InsufficientInventory { requested: i32, available: i32 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidArgument(_) => "invalid_argument",
            LedgerError::NotFound(_) => "not_found",
            LedgerError::BusinessRuleViolation(_) => "business_rule_violation",
            LedgerError::Conflict(_) => "conflict",
            LedgerError::InsufficientInventory { .. } => "insufficient_inventory",
            LedgerError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            LedgerError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::Conflict(_) => StatusCode::CONFLICT,
            LedgerError::BusinessRuleViolation(_) | LedgerError::InsufficientInventory { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            LedgerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Rule failures are final answers for the caller; internal failures may be retried.
    pub fn is_internal(&self) -> bool {
        matches!(self, LedgerError::Internal(_))
    }
}

impl From<diesel::result::Error> for LedgerError {
    fn from(e: diesel::result::Error) -> Self {
        LedgerError::Internal(format!("database error: {}", e))
    }
}

impl From<diesel_async::pooled_connection::bb8::RunError> for LedgerError {
    fn from(e: diesel_async::pooled_connection::bb8::RunError) -> Self {
        LedgerError::Internal(format!("connection pool error: {}", e))
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Internal(format!("serialization error: {}", e))
    }
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            LedgerError::Internal(detail) => {
                error!("Internal ledger failure: {}", detail);
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorResponse {
            error: self.code().to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}
