//! Credit ledger service.
//!
//! The ledger credits per-user balances from top-ups and game rewards. Each
//! credit is deduplicated by its idempotency key before anything else happens,
//! then applied under the user's exclusive lock so that concurrent credits for
//! one user never lose an update. Credits for different users proceed in
//! parallel. A stream of requests can be driven with one task per request.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinSet;
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

use crate::Amount;
use crate::config::LedgerConfig;
use crate::idempotency::{IdempotencyStore, Lookup};
use crate::keyed_mutex::KeyedMutex;
use crate::model::{
    BalanceView, CreditKind, CreditReceipt, CreditRequest, Fingerprint, IdempotencyKey,
    Operation, UserId,
};

mod state;
pub use state::UserAccount;

mod error;
pub use error::LedgerError;

/// Aggregate counters for operational visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LedgerStats {
    pub users: usize,
    /// Credits applied to a balance. Replays do not count.
    #[serde(rename = "totalOperations")]
    pub operations: u64,
    #[serde(rename = "uniqueIdempotencyKeys")]
    pub idempotency_keys: usize,
    pub replays: u64,
}

/// Outcome tally of [`Ledger::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub applied: usize,
    pub replayed: usize,
    pub rejected: usize,
}

enum Credited {
    Applied(CreditReceipt),
    Replayed(CreditReceipt),
}

impl Credited {
    fn into_receipt(self) -> CreditReceipt {
        match self {
            Credited::Applied(receipt) | Credited::Replayed(receipt) => receipt,
        }
    }
}

/// The credit ledger.
///
/// Accounts, locks and idempotency records live for the lifetime of the
/// ledger and are never evicted.
#[derive(Debug)]
pub struct Ledger {
    config: LedgerConfig,
    accounts: DashMap<UserId, UserAccount>,
    /// Serializes balance mutations per user
    locks: KeyedMutex<UserId>,
    idempotency: IdempotencyStore,
    operations: AtomicU64,
    replays: AtomicU64,
}

/// Public API
impl Ledger {
    pub fn new() -> Self {
        Self::with_config(LedgerConfig::default())
    }

    pub fn with_config(config: LedgerConfig) -> Self {
        Self {
            config,
            accounts: DashMap::new(),
            locks: KeyedMutex::new(),
            idempotency: IdempotencyStore::new(),
            operations: AtomicU64::new(0),
            replays: AtomicU64::new(0),
        }
    }

    /// Credit `amount` to `user` exactly once per idempotency `key`.
    ///
    /// A retry under the same key with the same payload returns the original
    /// receipt without touching the balance. Reusing the key with a different
    /// payload fails with [`LedgerError::IdempotencyConflict`].
    pub async fn credit(
        &self,
        user: impl Into<UserId>,
        amount: Amount,
        kind: CreditKind,
        key: impl Into<IdempotencyKey>,
    ) -> Result<CreditReceipt, LedgerError> {
        let fingerprint = Fingerprint {
            user: user.into(),
            amount,
            kind,
        };
        let key = key.into();
        self.process(fingerprint, &key)
            .await
            .map(Credited::into_receipt)
    }

    /// Monetary top-up; 1 USD credits 1 unit.
    pub async fn top_up(
        &self,
        user: impl Into<UserId>,
        amount_usd: Amount,
        key: impl Into<IdempotencyKey>,
    ) -> Result<CreditReceipt, LedgerError> {
        self.submit(CreditRequest::TopUp {
            user: user.into(),
            amount_usd,
            key: key.into(),
        })
        .await
    }

    /// Game reward paid in coins.
    pub async fn reward(
        &self,
        user: impl Into<UserId>,
        amount_coins: Amount,
        reward_id: impl Into<String>,
        key: impl Into<IdempotencyKey>,
    ) -> Result<CreditReceipt, LedgerError> {
        self.submit(CreditRequest::Reward {
            user: user.into(),
            amount_coins,
            reward_id: reward_id.into(),
            key: key.into(),
        })
        .await
    }

    pub async fn submit(&self, request: CreditRequest) -> Result<CreditReceipt, LedgerError> {
        let (fingerprint, key) = request.into_parts();
        self.process(fingerprint, &key)
            .await
            .map(Credited::into_receipt)
    }

    /// Current balance and recent operations of `user`.
    /// Users never credited read as a zero balance with no operations.
    pub fn balance(&self, user: &str) -> BalanceView {
        self.accounts
            .get(user)
            .map(|account| account.view())
            .unwrap_or_default()
    }

    /// Every credited user with their balance view, ordered by user id.
    pub fn accounts(&self) -> Vec<(UserId, BalanceView)> {
        let mut accounts: Vec<_> = self
            .accounts
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().view()))
            .collect();
        accounts.sort_by(|a, b| a.0.cmp(&b.0));
        accounts
    }

    pub fn stats(&self) -> LedgerStats {
        LedgerStats {
            users: self.accounts.len(),
            operations: self.operations.load(Ordering::Relaxed),
            idempotency_keys: self.idempotency.len(),
            replays: self.replays.load(Ordering::Relaxed),
        }
    }

    /// Process every request of `stream`, one task per request, and wait for
    /// all of them to finish.
    pub async fn run(
        self: &Arc<Self>,
        mut stream: impl Stream<Item = CreditRequest> + Unpin,
    ) -> RunSummary {
        let mut tasks = JoinSet::new();
        while let Some(request) = stream.next().await {
            let ledger = Arc::clone(self);
            tasks.spawn(async move {
                let (fingerprint, key) = request.into_parts();
                ledger.process(fingerprint, &key).await
            });
        }

        let mut summary = RunSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(Credited::Applied(_))) => summary.applied += 1,
                Ok(Ok(Credited::Replayed(_))) => summary.replayed += 1,
                Ok(Err(_)) => summary.rejected += 1,
                Err(e) => {
                    warn!(reason = %e, "credit task failed");
                    summary.rejected += 1;
                }
            }
        }
        summary
    }
}

/// Private API
impl Ledger {
    /// - Reject non-positive amounts before any state is touched
    /// - Replay or reject if the key is already known
    /// - Otherwise apply the credit and commit its receipt under the key
    async fn process(&self, fingerprint: Fingerprint, key: &str) -> Result<Credited, LedgerError> {
        if !fingerprint.amount.is_positive() {
            warn!(
                user = %fingerprint.user,
                key,
                amount = %fingerprint.amount,
                "credit rejected: non-positive amount"
            );
            return Err(LedgerError::InvalidAmount(fingerprint.amount));
        }

        let reservation = match self.idempotency.lookup_or_reserve(key, &fingerprint).await {
            Lookup::Miss(reservation) => reservation,
            Lookup::Hit(receipt) => {
                self.replays.fetch_add(1, Ordering::Relaxed);
                info!(user = %fingerprint.user, key, "idempotency hit, replaying receipt");
                return Ok(Credited::Replayed(receipt));
            }
            Lookup::Conflict => {
                warn!(
                    user = %fingerprint.user,
                    key,
                    "credit rejected: idempotency key reused with a different payload"
                );
                return Err(LedgerError::IdempotencyConflict(key.to_owned()));
            }
        };

        // an error here drops the reservation, releasing the key
        let receipt = self.apply(fingerprint).await?;
        reservation.commit(receipt.clone());
        Ok(Credited::Applied(receipt))
    }

    /// Read-modify-write of the user's balance under their exclusive lock.
    /// The balance and its log entry change together, or not at all.
    async fn apply(&self, fingerprint: Fingerprint) -> Result<CreditReceipt, LedgerError> {
        let Fingerprint { user, amount, kind } = fingerprint;
        let _guard = self.locks.acquire(user.as_str()).await;

        let op = Operation::now(kind, amount);
        let capacity = self.config.recent_ops_capacity;
        let balance = self
            .accounts
            .entry(user.clone())
            .or_insert_with(|| UserAccount::new(capacity))
            .apply(op.clone());
        let Some(balance) = balance else {
            warn!(
                user = %user,
                amount = %amount,
                "credit rejected: balance would overflow"
            );
            return Err(LedgerError::BalanceOverflow { user, amount });
        };
        self.operations.fetch_add(1, Ordering::Relaxed);

        info!(
            user = %user,
            kind = op.kind.name(),
            amount = %amount,
            balance = %balance,
            "credit applied"
        );

        Ok(CreditReceipt { balance, op })
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // test utils

    fn units(value: i64) -> Amount {
        Amount::from_units(value)
    }

    fn top_up(user: &str, amount: f64, key: &str) -> CreditRequest {
        CreditRequest::TopUp {
            user: user.to_string(),
            amount_usd: Amount::from_float(amount),
            key: key.to_string(),
        }
    }

    fn reward(user: &str, amount: f64, reward_id: &str, key: &str) -> CreditRequest {
        CreditRequest::Reward {
            user: user.to_string(),
            amount_coins: Amount::from_float(amount),
            reward_id: reward_id.to_string(),
            key: key.to_string(),
        }
    }

    async fn submit_all(ledger: &Arc<Ledger>, requests: Vec<CreditRequest>) -> Vec<CreditReceipt> {
        let mut tasks = JoinSet::new();
        for request in requests {
            let ledger = Arc::clone(ledger);
            tasks.spawn(async move { ledger.submit(request).await.unwrap() });
        }
        let mut receipts = Vec::new();
        while let Some(receipt) = tasks.join_next().await {
            receipts.push(receipt.unwrap());
        }
        receipts
    }

    #[test]
    fn new_ledger() {
        let ledger = Ledger::new();
        assert_eq!(ledger.stats(), LedgerStats::default());
        assert!(ledger.accounts().is_empty());
    }

    // Credits

    #[tokio::test]
    async fn top_up_creates_account_and_credits() {
        let ledger = Ledger::new();
        let receipt = ledger.top_up("alice", units(25), "k1").await.unwrap();

        assert_eq!(receipt.balance, units(25));
        assert_eq!(receipt.op.kind, CreditKind::TopUp);
        assert_eq!(receipt.op.amount, units(25));
        assert_eq!(ledger.balance("alice").balance, units(25));
    }

    #[tokio::test]
    async fn reward_records_reward_id() {
        let ledger = Ledger::new();
        let receipt = ledger.reward("alice", units(3), "r-7", "k1").await.unwrap();

        assert_eq!(
            receipt.op.kind,
            CreditKind::Reward {
                reward_id: "r-7".to_string()
            }
        );
        assert_eq!(ledger.balance("alice").recent_ops, vec![receipt.op]);
    }

    #[tokio::test]
    async fn credits_accumulate() {
        let ledger = Ledger::new();
        ledger.top_up("alice", units(10), "k1").await.unwrap();
        let receipt = ledger.reward("alice", units(5), "r", "k2").await.unwrap();

        assert_eq!(receipt.balance, units(15));
        assert_eq!(ledger.stats().operations, 2);
    }

    #[tokio::test]
    async fn credit_with_explicit_kind() {
        let ledger = Ledger::new();
        let receipt = ledger
            .credit("alice", units(4), CreditKind::TopUp, "k1")
            .await
            .unwrap();
        assert_eq!(receipt.balance, units(4));
    }

    #[tokio::test]
    async fn users_are_independent() {
        let ledger = Ledger::new();
        ledger.top_up("alice", units(10), "k1").await.unwrap();
        ledger.top_up("bob", units(20), "k2").await.unwrap();

        assert_eq!(ledger.balance("alice").balance, units(10));
        assert_eq!(ledger.balance("bob").balance, units(20));

        let users: Vec<_> = ledger.accounts().into_iter().map(|(u, _)| u).collect();
        assert_eq!(users, vec!["alice".to_string(), "bob".to_string()]);
    }

    // Invalid amounts

    #[tokio::test]
    async fn non_positive_amount_is_rejected_without_state_change() {
        let ledger = Ledger::new();

        for amount in [Amount::ZERO, Amount::from_float(-5.0)] {
            let result = ledger.top_up("alice", amount, "k1").await;
            assert_eq!(result, Err(LedgerError::InvalidAmount(amount)));
        }

        assert_eq!(ledger.balance("alice"), BalanceView::default());
        assert_eq!(ledger.stats(), LedgerStats::default());
    }

    #[tokio::test]
    async fn key_is_usable_after_invalid_amount() {
        let ledger = Ledger::new();
        ledger.top_up("alice", Amount::ZERO, "k1").await.unwrap_err();

        let receipt = ledger.top_up("alice", units(5), "k1").await.unwrap();
        assert_eq!(receipt.balance, units(5));
    }

    #[tokio::test]
    async fn overflowing_credit_is_rejected_and_releases_key() {
        let ledger = Ledger::new();
        let big = Amount::from_float(6e14);
        ledger.top_up("alice", big, "k1").await.unwrap();

        let result = ledger.top_up("alice", big, "k2").await;
        assert_eq!(
            result,
            Err(LedgerError::BalanceOverflow {
                user: "alice".to_string(),
                amount: big,
            })
        );

        let view = ledger.balance("alice");
        assert_eq!(view.balance, big);
        assert_eq!(view.recent_ops.len(), 1);
        let stats = ledger.stats();
        assert_eq!(stats.operations, 1);
        assert_eq!(stats.idempotency_keys, 1);

        // the rejected key is free for a payload that fits
        let receipt = ledger.top_up("alice", units(1), "k2").await.unwrap();
        assert_eq!(receipt.balance, big + units(1));
    }

    // Idempotency

    #[tokio::test]
    async fn replay_returns_first_receipt_without_mutation() {
        let ledger = Ledger::new();
        let first = ledger.top_up("alice", units(25), "k1").await.unwrap();
        let second = ledger.top_up("alice", units(25), "k1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(ledger.balance("alice").balance, units(25));
        assert_eq!(ledger.balance("alice").recent_ops.len(), 1);

        let stats = ledger.stats();
        assert_eq!(stats.operations, 1);
        assert_eq!(stats.replays, 1);
        assert_eq!(stats.idempotency_keys, 1);
    }

    #[tokio::test]
    async fn key_reuse_with_different_amount_conflicts() {
        let ledger = Ledger::new();
        ledger.top_up("alice", units(25), "k1").await.unwrap();

        let result = ledger.top_up("alice", units(30), "k1").await;
        assert_eq!(
            result,
            Err(LedgerError::IdempotencyConflict("k1".to_string()))
        );
        assert_eq!(ledger.balance("alice").balance, units(25));
        assert_eq!(ledger.stats().operations, 1);
    }

    #[tokio::test]
    async fn key_reuse_across_kinds_conflicts() {
        let ledger = Ledger::new();
        ledger.top_up("alice", units(5), "k1").await.unwrap();

        let result = ledger.reward("alice", units(5), "r", "k1").await;
        assert!(matches!(result, Err(LedgerError::IdempotencyConflict(_))));
    }

    #[tokio::test]
    async fn key_reuse_for_other_user_conflicts() {
        let ledger = Ledger::new();
        ledger.top_up("alice", units(5), "k1").await.unwrap();

        let result = ledger.top_up("bob", units(5), "k1").await;
        assert!(matches!(result, Err(LedgerError::IdempotencyConflict(_))));
        assert_eq!(ledger.balance("bob"), BalanceView::default());
    }

    #[tokio::test]
    async fn key_reuse_with_different_reward_id_conflicts() {
        let ledger = Ledger::new();
        ledger.reward("alice", units(5), "r-1", "k1").await.unwrap();

        let result = ledger.reward("alice", units(5), "r-2", "k1").await;
        assert!(matches!(result, Err(LedgerError::IdempotencyConflict(_))));
    }

    // Concurrency

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_credits_lose_no_updates() {
        let ledger = Arc::new(Ledger::new());
        let mut requests = Vec::new();
        for i in 0..100 {
            requests.push(top_up("stress", 5.0, &format!("top-{i}")));
            requests.push(reward("stress", 3.0, &format!("r{i}"), &format!("rew-{i}")));
        }

        let receipts = submit_all(&ledger, requests).await;

        assert_eq!(receipts.len(), 200);
        assert_eq!(ledger.balance("stress").balance, Amount::from_float(800.0));
        assert_eq!(ledger.stats().operations, 200);

        // every intermediate balance was observed by exactly one credit
        let mut balances: Vec<_> = receipts.iter().map(|r| r.balance).collect();
        balances.sort();
        balances.dedup();
        assert_eq!(balances.len(), 200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_duplicates_credit_once() {
        let ledger = Arc::new(Ledger::new());
        let requests = (0..50).map(|_| top_up("alice", 25.0, "dup")).collect();

        let receipts = submit_all(&ledger, requests).await;

        assert!(receipts.iter().all(|r| *r == receipts[0]));
        assert_eq!(receipts[0].balance, units(25));
        assert_eq!(ledger.balance("alice").balance, units(25));

        let stats = ledger.stats();
        assert_eq!(stats.operations, 1);
        assert_eq!(stats.replays, 49);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_users_proceed_independently() {
        let ledger = Arc::new(Ledger::new());
        let mut requests = Vec::new();
        for user in 0..20 {
            for i in 0..10 {
                requests.push(top_up(&format!("user-{user}"), 1.5, &format!("{user}-{i}")));
            }
        }

        submit_all(&ledger, requests).await;

        let accounts = ledger.accounts();
        assert_eq!(accounts.len(), 20);
        assert!(
            accounts
                .iter()
                .all(|(_, view)| view.balance == Amount::from_float(15.0))
        );
    }

    // Reads

    #[test]
    fn unknown_user_reads_as_empty() {
        let ledger = Ledger::new();
        let view = ledger.balance("nobody");

        assert_eq!(view.balance, Amount::ZERO);
        assert!(view.recent_ops.is_empty());
        assert_eq!(ledger.stats().users, 0);
    }

    #[tokio::test]
    async fn recent_ops_keep_newest_ten() {
        let ledger = Ledger::new();
        for i in 1..=12 {
            ledger.top_up("alice", units(i), format!("k{i}")).await.unwrap();
        }

        let view = ledger.balance("alice");
        assert_eq!(view.balance, units(78));
        assert_eq!(view.recent_ops.len(), 10);

        let amounts: Vec<_> = view.recent_ops.iter().map(|op| op.amount).collect();
        let expected: Vec<_> = (3..=12).rev().map(units).collect();
        assert_eq!(amounts, expected);
    }

    #[tokio::test]
    async fn recent_ops_capacity_is_configurable() {
        let ledger = Ledger::with_config(LedgerConfig {
            recent_ops_capacity: 3,
        });
        for i in 1..=5 {
            ledger.top_up("alice", units(i), format!("k{i}")).await.unwrap();
        }

        assert_eq!(ledger.balance("alice").recent_ops.len(), 3);
    }

    #[tokio::test]
    async fn balance_matches_logged_operations() {
        let ledger = Ledger::new();
        ledger.top_up("alice", Amount::from_float(1.25), "k1").await.unwrap();
        ledger.reward("alice", Amount::from_float(2.5), "r", "k2").await.unwrap();

        let view = ledger.balance("alice");
        let logged: Amount = view.recent_ops.iter().map(|op| op.amount).sum();
        assert_eq!(view.balance, logged);
    }

    // Stats

    #[tokio::test]
    async fn stats_count_users_operations_and_keys() {
        let ledger = Ledger::new();
        ledger.top_up("alice", units(1), "k1").await.unwrap();
        ledger.top_up("alice", units(1), "k2").await.unwrap();
        ledger.reward("bob", units(1), "r", "k3").await.unwrap();
        ledger.top_up("alice", units(1), "k1").await.unwrap();

        let stats = ledger.stats();
        assert_eq!(
            stats,
            LedgerStats {
                users: 2,
                operations: 3,
                idempotency_keys: 3,
                replays: 1,
            }
        );
    }

    #[test]
    fn stats_json_shape() {
        let json = serde_json::to_value(LedgerStats::default()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "users": 0,
                "totalOperations": 0,
                "uniqueIdempotencyKeys": 0,
                "replays": 0
            })
        );
    }

    // Async run()

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn run_processes_all_requests() {
        let ledger = Arc::new(Ledger::new());
        let requests = vec![
            top_up("alice", 50.0, "k-topup-1"),
            reward("alice", 30.0, "r-1", "k-reward-1"),
            top_up("bob", 10.0, "k-bob"),
        ];

        let summary = ledger.run(tokio_stream::iter(requests)).await;

        assert_eq!(
            summary,
            RunSummary {
                applied: 3,
                replayed: 0,
                rejected: 0
            }
        );
        assert_eq!(ledger.balance("alice").balance, units(80));
        assert_eq!(ledger.balance("bob").balance, units(10));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn run_tallies_replays_and_rejections() {
        let ledger = Arc::new(Ledger::new());
        ledger.top_up("alice", units(10), "seen").await.unwrap();

        let requests = vec![
            // replay
            top_up("alice", 10.0, "seen"),
            // conflict
            top_up("alice", 99.0, "seen"),
            // invalid amount
            top_up("alice", -1.0, "bad"),
            top_up("alice", 5.0, "fresh"),
        ];

        let summary = ledger.run(tokio_stream::iter(requests)).await;

        assert_eq!(
            summary,
            RunSummary {
                applied: 1,
                replayed: 1,
                rejected: 2
            }
        );
        assert_eq!(ledger.balance("alice").balance, units(15));
    }

    #[tokio::test]
    async fn receipt_json_shape() {
        let ledger = Ledger::new();
        let receipt = ledger.reward("alice", units(3), "r-1", "k1").await.unwrap();

        let json = serde_json::to_value(&receipt).unwrap();
        assert_eq!(json["balance"], 3.0);
        assert_eq!(json["op"]["type"], "reward");
        assert_eq!(json["op"]["rewardId"], "r-1");
        assert_eq!(json["op"]["amount"], 3.0);
        assert!(json["op"]["timestamp"].is_f64());
    }
}
