//! Error types for Tallybank ledger operations.

use thiserror::Error;

use crate::{AccountId, Currency};

/// Main error type for ledger operations.
#[derive(Error, Debug)]
pub enum BankError {
    /// Requested row does not exist.
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// Unique constraint violated (duplicate username, email, owner currency...).
    #[error("{entity} already exists: violates {constraint}")]
    AlreadyExists {
        entity: &'static str,
        constraint: String,
    },

    /// Referenced row does not exist.
    #[error("Foreign key violation: {constraint}")]
    ForeignKeyViolation { constraint: String },

    /// Invalid request parameters.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        message: String,
        field: Option<String>,
    },

    /// Debit would leave the account with a negative balance.
    #[error("Insufficient funds in account {account_id}: balance {balance}, required {required}")]
    InsufficientFunds {
        account_id: AccountId,
        balance: i64,
        required: i64,
    },

    /// Accounts of a transfer hold different currencies.
    #[error("Currency mismatch: account {from_account} holds {from_currency}, account {to_account} holds {to_currency}")]
    CurrencyMismatch {
        from_account: AccountId,
        from_currency: Currency,
        to_account: AccountId,
        to_currency: Currency,
    },

    /// The store aborted the transaction to break a lock cycle.
    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// The operation's deadline passed.
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// The unit of work failed and the rollback failed as well.
    #[error("Transaction failed: {source}; rollback failed: {rollback}")]
    RollbackFailed {
        source: Box<BankError>,
        rollback: Box<BankError>,
    },

    /// Background task could not be enqueued.
    #[error("Task distribution failed: {0}")]
    TaskDistribution(String),

    /// Connection pool was shut down.
    #[error("Store is closed")]
    StoreClosed,

    /// Database error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl BankError {
    /// Create a not-found error.
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        BankError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Create an invalid-argument error for a field.
    pub fn invalid_argument(field: impl Into<String>, message: impl Into<String>) -> Self {
        BankError::InvalidArgument {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Check if this error reports a missing row.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BankError::NotFound { .. })
    }

    /// Check if this error reports a unique-key conflict.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, BankError::AlreadyExists { .. })
    }

    /// Check if this error comes from the caller's context rather than the domain.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BankError::Cancelled | BankError::DeadlineExceeded)
    }

    /// Check if the whole operation may be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BankError::Deadlock(_) | BankError::DatabaseError(_))
    }

    /// Get error code for responses and metrics.
    pub fn error_code(&self) -> &'static str {
        match self {
            BankError::NotFound { .. } => "NOT_FOUND",
            BankError::AlreadyExists { .. } => "ALREADY_EXISTS",
            BankError::ForeignKeyViolation { .. } => "FOREIGN_KEY_VIOLATION",
            BankError::InvalidArgument { .. } => "INVALID_ARGUMENT",
            BankError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            BankError::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            BankError::Deadlock(_) => "DEADLOCK",
            BankError::Cancelled => "CANCELLED",
            BankError::DeadlineExceeded => "DEADLINE_EXCEEDED",
            BankError::RollbackFailed { .. } => "ROLLBACK_FAILED",
            BankError::TaskDistribution(_) => "TASK_DISTRIBUTION",
            BankError::StoreClosed => "STORE_CLOSED",
            BankError::DatabaseError(_) => "DATABASE_ERROR",
            BankError::ConfigurationError(_) => "CONFIGURATION_ERROR",
            BankError::InternalError(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, BankError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_failure_names_both_errors() {
        let err = BankError::RollbackFailed {
            source: Box::new(BankError::not_found("account", 7)),
            rollback: Box::new(BankError::DatabaseError("connection reset".to_string())),
        };

        let message = err.to_string();
        assert!(message.contains("account not found: 7"));
        assert!(message.contains("connection reset"));
        assert_eq!(err.error_code(), "ROLLBACK_FAILED");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_classification() {
        assert!(BankError::not_found("user", "alice").is_not_found());
        assert!(BankError::AlreadyExists {
            entity: "user",
            constraint: "users_pkey".to_string(),
        }
        .is_already_exists());
        assert!(BankError::Cancelled.is_cancellation());
        assert!(BankError::DeadlineExceeded.is_cancellation());
        assert!(!BankError::Deadlock("cycle".to_string()).is_cancellation());
        assert!(BankError::Deadlock("cycle".to_string()).is_retryable());
        assert!(!BankError::invalid_argument("amount", "must be positive").is_retryable());
    }
}
