use crate::Amount;
use crate::model::{BalanceView, Operation};
use crate::recent_ops::RecentOps;

/// A user's balance and the log of operations that built it.
#[derive(Debug, Clone, Default)]
pub struct UserAccount {
    balance: Amount,
    recent: RecentOps,
}

impl UserAccount {
    pub fn new(recent_ops_capacity: usize) -> Self {
        Self {
            balance: Amount::ZERO,
            recent: RecentOps::with_capacity(recent_ops_capacity),
        }
    }

    /// Add the operation's amount and log it. Returns the new balance, or
    /// `None` without changing anything if the balance would overflow.
    pub fn apply(&mut self, op: Operation) -> Option<Amount> {
        let balance = self.balance.checked_add(op.amount)?;
        self.balance = balance;
        self.recent.append(op);
        Some(balance)
    }

    pub fn view(&self) -> BalanceView {
        BalanceView {
            balance: self.balance,
            recent_ops: self.recent.snapshot(),
        }
    }
}
