//! The module contains the errors the engine can return.
//!
//! Business conflicts (not found, ineligible values, idempotency collisions)
//! are ordinary variants and are returned, never panicked. Only
//! [`InvariantViolation`], [`Gateway`] and [`Database`] describe failures the
//! caller cannot fix by changing the request.
//!
//!  [`InvariantViolation`]: EngineError::InvariantViolation
//!  [`Gateway`]: EngineError::Gateway
//!  [`Database`]: EngineError::Database
use sea_orm::DbErr;
use thiserror::Error;

/// Engine custom errors.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Value \"{0}\" not found")]
    ValueNotFound(String),
    #[error("Contact \"{0}\" not found")]
    ContactNotFound(String),
    #[error("Currency \"{0}\" not found")]
    CurrencyNotFound(String),
    #[error("Transaction \"{0}\" not found")]
    TransactionNotFound(String),

    #[error("Value \"{0}\" is not active")]
    ValueNotActive(String),
    #[error("Value \"{0}\" is frozen")]
    ValueFrozen(String),
    #[error("Value \"{0}\" is canceled")]
    ValueCanceled(String),
    #[error("Value \"{0}\" is expired")]
    ValueExpired(String),
    #[error("Value \"{0}\" has not started yet")]
    ValueNotStarted(String),
    #[error("Wrong currency: {0}")]
    WrongCurrency(String),
    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),
    #[error("Insufficient uses remaining: {0}")]
    InsufficientUsesRemaining(String),
    #[error("Value \"{0}\" was modified concurrently, retry the request")]
    ValueModified(String),
    #[error("Value \"{0}\" is referenced by transactions")]
    ValueInUse(String),

    #[error("Transaction \"{0}\" is not pending")]
    TransactionNotPending(String),
    #[error("Transaction \"{0}\" has already been voided")]
    TransactionVoided(String),
    #[error("Transaction \"{0}\" has already been captured")]
    TransactionCaptured(String),
    #[error("Transaction \"{0}\" has already been reversed")]
    TransactionReversed(String),
    #[error("Transaction \"{0}\" cannot be reversed")]
    TransactionNotReversible(String),

    #[error("Value \"{0}\" already exists")]
    ValueIdExists(String),
    #[error("Transaction \"{0}\" already exists")]
    TransactionIdExists(String),
    #[error("Value \"{0}\" is already attached")]
    ValueAlreadyAttached(String),
    #[error("A Value with this code already exists")]
    ValueCodeExists,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Invalid rule: {0}")]
    InvalidRule(String),
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
    #[error("Charge gateway failure: {0}")]
    Gateway(String),
    #[error(transparent)]
    Database(#[from] DbErr),
}

impl EngineError {
    /// Stable machine readable code, used by the HTTP collaborator in
    /// response bodies.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ValueNotFound(_) => "ValueNotFound",
            Self::ContactNotFound(_) => "ContactNotFound",
            Self::CurrencyNotFound(_) => "CurrencyNotFound",
            Self::TransactionNotFound(_) => "TransactionNotFound",
            Self::ValueNotActive(_) => "ValueNotActive",
            Self::ValueFrozen(_) => "ValueFrozen",
            Self::ValueCanceled(_) => "ValueCanceled",
            Self::ValueExpired(_) => "ValueExpired",
            Self::ValueNotStarted(_) => "ValueNotStarted",
            Self::WrongCurrency(_) => "WrongCurrency",
            Self::InsufficientBalance(_) => "InsufficientBalance",
            Self::InsufficientUsesRemaining(_) => "InsufficientUsesRemaining",
            Self::ValueModified(_) => "ValueModified",
            Self::ValueInUse(_) => "ValueInUse",
            Self::TransactionNotPending(_) => "TransactionNotPending",
            Self::TransactionVoided(_) => "TransactionVoided",
            Self::TransactionCaptured(_) => "TransactionCaptured",
            Self::TransactionReversed(_) => "TransactionReversed",
            Self::TransactionNotReversible(_) => "TransactionNotReversible",
            Self::ValueIdExists(_) => "ValueIdExists",
            Self::TransactionIdExists(_) => "TransactionIdExists",
            Self::ValueAlreadyAttached(_) => "ValueAlreadyAttached",
            Self::ValueCodeExists => "ValueCodeExists",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::InvalidRule(_) => "InvalidRule",
            Self::InvalidCursor(_) => "InvalidCursor",
            Self::Forbidden(_) => "Forbidden",
            Self::InvariantViolation(_) => "InternalError",
            Self::Gateway(_) => "GatewayError",
            Self::Database(_) => "InternalError",
        }
    }

    /// `true` when retrying the whole request from the top may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ValueModified(_))
    }

    /// `true` for failures that indicate a bug or a broken store rather than a
    /// business conflict.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::InvariantViolation(_) | Self::Gateway(_) | Self::Database(_)
        )
    }
}

impl PartialEq for EngineError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Database(a), Self::Database(b)) => a.to_string() == b.to_string(),
            (Self::ValueCodeExists, Self::ValueCodeExists) => true,
            (a, b) => a.code() == b.code() && a.to_string() == b.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            EngineError::ValueAlreadyAttached("v".to_string()).code(),
            "ValueAlreadyAttached"
        );
        assert_eq!(
            EngineError::InvariantViolation("x".to_string()).code(),
            "InternalError"
        );
    }

    #[test]
    fn only_value_modified_is_retryable() {
        assert!(EngineError::ValueModified("v".to_string()).is_retryable());
        assert!(!EngineError::InsufficientBalance("v".to_string()).is_retryable());
    }
}
