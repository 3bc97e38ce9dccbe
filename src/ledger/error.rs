//! Error types for credit processing.

use thiserror::Error;

use crate::Amount;
use crate::model::{IdempotencyKey, UserId};

/// Error returned by [`Ledger::credit`](super::Ledger::credit).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("amount must be positive, got {0}")]
    InvalidAmount(Amount),

    #[error("idempotency key '{0}' was already used with a different payload")]
    IdempotencyConflict(IdempotencyKey),

    #[error("crediting {amount} would overflow the balance of user '{user}'")]
    BalanceOverflow { user: UserId, amount: Amount },
}

impl LedgerError {
    /// HTTP status a transport layer reports this error with.
    pub fn status_code(&self) -> u16 {
        match self {
            LedgerError::InvalidAmount(_) | LedgerError::BalanceOverflow { .. } => 422,
            LedgerError::IdempotencyConflict(_) => 409,
        }
    }
}
