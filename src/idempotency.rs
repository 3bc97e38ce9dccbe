//! Idempotency-key deduplication.
//!
//! Every key maps to a record holding the fingerprint of the request that
//! first claimed it and, once that request finishes, its receipt. Claiming a
//! key is an atomic insert-if-absent on the key's shard, independent of any
//! per-user lock, so two concurrent submissions of one key can never both
//! execute. The loser waits on the record until the winner commits and then
//! replays the committed receipt.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tokio::sync::watch;

use crate::model::{CreditReceipt, Fingerprint, IdempotencyKey};

/// Outcome of [`IdempotencyStore::lookup_or_reserve`].
#[derive(Debug)]
pub enum Lookup<'a> {
    /// The key was already processed with the same fingerprint.
    Hit(CreditReceipt),
    /// The key is new; the caller now owns it and must commit a receipt.
    Miss(Reservation<'a>),
    /// The key is held by a request with a different fingerprint.
    Conflict,
}

#[derive(Debug, Clone)]
enum RecordState {
    Pending,
    Committed(CreditReceipt),
    Abandoned,
}

#[derive(Debug)]
struct Record {
    fingerprint: Fingerprint,
    state: watch::Sender<RecordState>,
}

impl Record {
    fn pending(fingerprint: Fingerprint) -> Self {
        let (state, _) = watch::channel(RecordState::Pending);
        Self { fingerprint, state }
    }

    /// Wait until the owner of this record commits or abandons it.
    async fn settled(&self) -> RecordState {
        let mut rx = self.state.subscribe();
        match rx
            .wait_for(|state| !matches!(state, RecordState::Pending))
            .await
        {
            Ok(state) => state.clone(),
            Err(_) => RecordState::Abandoned,
        }
    }
}

/// Concurrent map from idempotency key to fingerprint and cached receipt.
#[derive(Debug, Default)]
pub struct IdempotencyStore {
    records: DashMap<IdempotencyKey, Arc<Record>>,
}

impl IdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look `key` up, claiming it if no record exists.
    ///
    /// A matching record that is still pending is awaited: the call resolves
    /// to `Hit` once its owner commits, or retries the claim if the owner
    /// gave up without committing.
    pub async fn lookup_or_reserve(&self, key: &str, fingerprint: &Fingerprint) -> Lookup<'_> {
        loop {
            let record = match self.records.entry(key.to_owned()) {
                Entry::Occupied(entry) => Arc::clone(entry.get()),
                Entry::Vacant(entry) => {
                    let record = Arc::new(Record::pending(fingerprint.clone()));
                    entry.insert(Arc::clone(&record));
                    return Lookup::Miss(Reservation {
                        store: self,
                        key: key.to_owned(),
                        record,
                        committed: false,
                    });
                }
            };

            if record.fingerprint != *fingerprint {
                return Lookup::Conflict;
            }

            match record.settled().await {
                RecordState::Committed(receipt) => return Lookup::Hit(receipt),
                RecordState::Pending | RecordState::Abandoned => continue,
            }
        }
    }

    /// Number of distinct keys held, committed or pending.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Exclusive claim on an idempotency key.
///
/// Dropping a reservation without committing releases the key and wakes any
/// duplicate submissions waiting on it.
#[derive(Debug)]
pub struct Reservation<'a> {
    store: &'a IdempotencyStore,
    key: IdempotencyKey,
    record: Arc<Record>,
    committed: bool,
}

impl Reservation<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Record the receipt of the claimed request and release waiters with it.
    pub fn commit(mut self, receipt: CreditReceipt) {
        self.record
            .state
            .send_replace(RecordState::Committed(receipt));
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        self.store
            .records
            .remove_if(&self.key, |_, record| Arc::ptr_eq(record, &self.record));
        self.record.state.send_replace(RecordState::Abandoned);
    }
}
