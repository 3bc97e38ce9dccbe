pub mod amount;
pub mod config;
pub mod csv;
pub mod idempotency;
pub mod keyed_mutex;
pub mod ledger;
pub mod model;
pub mod recent_ops;

pub use amount::Amount;
pub use config::LedgerConfig;
pub use ledger::{Ledger, LedgerError, LedgerStats, RunSummary};
pub use model::{
    BalanceView, CreditKind, CreditReceipt, CreditRequest, IdempotencyKey, Operation, UserId,
};
