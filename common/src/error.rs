//! Error types for the card issuer ledger.

use crate::{BatchId, CardId, Currency, TransactionId};
use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for issuer and ledger operations.
#[derive(Error, Debug)]
pub enum IssuerError {
    /// No account for the (card, currency) pair.
    #[error("Account not found: {card_id}:{currency}")]
    AccountNotFound { card_id: CardId, currency: Currency },

    /// An account for the (card, currency) pair already exists.
    #[error("Account already exists: {card_id}:{currency}")]
    DuplicateAccount { card_id: CardId, currency: Currency },

    /// Balance too low for the requested authorisation.
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    /// No pending authorisation carries this transaction id.
    #[error("Authorisation not found: {0}")]
    AuthorisationNotFound(TransactionId),

    /// A pending authorisation with this transaction id already exists.
    #[error("Duplicate authorisation: {0}")]
    DuplicateAuthorisation(TransactionId),

    /// Currency outside the configured set.
    #[error("Currency \"{0}\" not available.")]
    InvalidCurrency(String),

    /// A boundary field failed validation.
    #[error("Invalid {field}: {message}")]
    InvalidInput { field: String, message: String },

    /// A transfer between accounts of different currencies.
    #[error("Currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch { expected: Currency, actual: Currency },

    /// Journals of a batch do not sum to zero.
    #[error("Unbalanced batch {batch_id}: journals sum to {sum}")]
    UnbalancedBatch { batch_id: BatchId, sum: Decimal },

    /// Storage failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl IssuerError {
    /// Build an [`IssuerError::InvalidInput`].
    pub fn invalid_input(field: impl Into<String>, message: impl Into<String>) -> Self {
        IssuerError::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Errors a transport adapter reports as "not found".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            IssuerError::AccountNotFound { .. } | IssuerError::AuthorisationNotFound(_)
        )
    }

    /// Errors caused by caller input, raised before any storage access.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            IssuerError::InvalidCurrency(_) | IssuerError::InvalidInput { .. }
        )
    }

    /// Get error code for transport adapters.
    pub fn error_code(&self) -> &'static str {
        match self {
            IssuerError::AccountNotFound { .. } => "ACCOUNT_NOT_FOUND",
            IssuerError::DuplicateAccount { .. } => "DUPLICATE_ACCOUNT",
            IssuerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            IssuerError::AuthorisationNotFound(_) => "AUTHORISATION_NOT_FOUND",
            IssuerError::DuplicateAuthorisation(_) => "DUPLICATE_AUTHORISATION",
            IssuerError::InvalidCurrency(_) => "INVALID_CURRENCY",
            IssuerError::InvalidInput { .. } => "INVALID_INPUT",
            IssuerError::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            IssuerError::UnbalancedBatch { .. } => "UNBALANCED_BATCH",
            IssuerError::Database(_) => "DATABASE_ERROR",
            IssuerError::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }
}

/// Result type alias for issuer operations.
pub type Result<T> = std::result::Result<T, IssuerError>;
