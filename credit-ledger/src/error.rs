//! Error types for the credit ledger

use crate::types::UserId;
use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Ledger errors
///
/// Closed set: every failure of a ledger operation is one of these kinds.
/// Translation to transport responses happens in [`crate::handlers`] only.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Bad input (non-positive amount, unknown user, malformed query)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Debit attempted before the user was ever credited
    #[error("no credit has been granted to user {user_id} yet; allocate credit before debiting")]
    NoCreditHistory { user_id: UserId },

    /// Every candidate grant was excluded because it expired
    #[error("all available credits for user {user_id} have expired; allocate new credit before debiting")]
    AllCreditsExpired { user_id: UserId },

    /// Debit exceeds the sum of spendable grants
    #[error("insufficient credit: requested {requested}, available {available}; add credit or reduce the debit amount")]
    InsufficientCredit {
        requested: Decimal,
        available: Decimal,
    },

    /// Connection, transaction, constraint, or timeout failure. The enclosing
    /// transaction has been rolled back.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Stable machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::Validation(_) => "validation_error",
            LedgerError::NoCreditHistory { .. } => "no_credit_history",
            LedgerError::AllCreditsExpired { .. } => "all_credits_expired",
            LedgerError::InsufficientCredit { .. } => "insufficient_credit",
            LedgerError::Storage(_) => "storage_error",
        }
    }

    /// Business-rule rejection the user can act on
    pub fn is_business_rule(&self) -> bool {
        matches!(
            self,
            LedgerError::NoCreditHistory { .. }
                | LedgerError::AllCreditsExpired { .. }
                | LedgerError::InsufficientCredit { .. }
        )
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

/// Activity cache errors. Never fatal to a request.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Redis error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Cached payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A process-wide cache is already installed
    #[error("Activity cache already installed")]
    AlreadyInstalled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_business_rule_classification() {
        let user_id = UserId::random();

        assert!(LedgerError::NoCreditHistory { user_id }.is_business_rule());
        assert!(LedgerError::AllCreditsExpired { user_id }.is_business_rule());
        assert!(LedgerError::InsufficientCredit {
            requested: dec!(5),
            available: dec!(3),
        }
        .is_business_rule());

        assert!(!LedgerError::Validation("amount".to_string()).is_business_rule());
        assert!(!LedgerError::Storage("down".to_string()).is_business_rule());
    }

    #[test]
    fn test_insufficient_credit_message_carries_amounts() {
        let err = LedgerError::InsufficientCredit {
            requested: dec!(12.50),
            available: dec!(7.25),
        };

        let message = err.to_string();
        assert!(message.contains("12.50"));
        assert!(message.contains("7.25"));
        assert_eq!(err.kind(), "insufficient_credit");
    }

    #[test]
    fn test_sqlx_error_maps_to_storage() {
        let err: LedgerError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.kind(), "storage_error");
    }
}
