//! Core domain types for the credit ledger.

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::Amount;

/// User identifier.
pub type UserId = String;

/// Client-supplied token identifying one logical request.
pub type IdempotencyKey = String;

/// Source of a credit. A reward carries the id of the game reward it pays out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CreditKind {
    #[serde(rename = "topup")]
    TopUp,
    Reward {
        #[serde(rename = "rewardId")]
        reward_id: String,
    },
}

impl CreditKind {
    pub fn name(&self) -> &'static str {
        match self {
            CreditKind::TopUp => "topup",
            CreditKind::Reward { .. } => "reward",
        }
    }
}

/// A mutation applied to a user's balance. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Operation {
    #[serde(flatten)]
    pub kind: CreditKind,
    pub amount: Amount,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl Operation {
    /// Create an operation stamped with the current wall-clock time.
    pub fn now(kind: CreditKind, amount: Amount) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Self {
            kind,
            amount,
            timestamp,
        }
    }
}

/// The side-effect relevant part of a credit request, i.e. everything but the
/// idempotency key. Two submissions under one key must carry equal fingerprints.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub user: UserId,
    pub amount: Amount,
    pub kind: CreditKind,
}

/// Result of a credit, replayed verbatim for retries under the same key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreditReceipt {
    pub balance: Amount,
    pub op: Operation,
}

/// Balance and most recent operations of one user, newest first.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceView {
    pub balance: Amount,
    pub recent_ops: Vec<Operation>,
}

/// A credit request as received from a client.
#[derive(Debug, Clone)]
pub enum CreditRequest {
    /// Monetary top-up; 1 USD credits 1 unit.
    TopUp {
        user: UserId,
        amount_usd: Amount,
        key: IdempotencyKey,
    },
    /// Game reward paid in coins.
    Reward {
        user: UserId,
        amount_coins: Amount,
        reward_id: String,
        key: IdempotencyKey,
    },
}

impl CreditRequest {
    /// Split into the fingerprint and the idempotency key it is submitted under.
    pub fn into_parts(self) -> (Fingerprint, IdempotencyKey) {
        match self {
            CreditRequest::TopUp {
                user,
                amount_usd,
                key,
            } => (
                Fingerprint {
                    user,
                    amount: usd_to_units(amount_usd),
                    kind: CreditKind::TopUp,
                },
                key,
            ),
            CreditRequest::Reward {
                user,
                amount_coins,
                reward_id,
                key,
            } => (
                Fingerprint {
                    user,
                    amount: amount_coins,
                    kind: CreditKind::Reward { reward_id },
                },
                key,
            ),
        }
    }
}

/// Fixed conversion: one USD is one ledger unit.
pub fn usd_to_units(amount_usd: Amount) -> Amount {
    amount_usd
}
