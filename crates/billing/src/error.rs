//! Billing error types

use thiserror::Error;

/// License accounting and pricing errors
///
/// Validation variants are always raised before any mutation; a mutating
/// operation that fails after that point rolls its transaction back.
#[derive(Debug, Error)]
pub enum BillingError {
    /// Plan rules forbid the action (wrong plan type, multiple properties disallowed, ...)
    #[error("Plan constraint violation: {0}")]
    PlanConstraintViolation(String),

    #[error("Insufficient license capacity: limit is {limit} licenses, operation requires {requested}")]
    InsufficientLicenseCapacity { limit: i64, requested: i64 },

    /// Detaching the only remaining property must go through cancellation instead
    #[error("Cannot detach the last property: {0}")]
    LastPropertyViolation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Underlying persistence unreachable; never treated as a zero count
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid tier schedule: {0}")]
    InvalidTierSchedule(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Whether a caller-side retry can reasonably succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, BillingError::StoreUnavailable(_))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => BillingError::NotFound("row not found".to_string()),
            // Partial unique indexes back the "one active link per property" rule
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                BillingError::PlanConstraintViolation(db.message().to_string())
            }
            other => BillingError::StoreUnavailable(other.to_string()),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
