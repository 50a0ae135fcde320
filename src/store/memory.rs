//! In-process store implementations.
//!
//! Used by the binary when no external store is configured and by tests.
//! The quota store honours TTLs and lock leases the same way a shared
//! key-value server would, so ledger behaviour is identical.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{AccountStore, HistoryStore, LockLease, Namespace, QuotaStore};
use crate::types::{AccountCredential, AccountUpdate, StoreError, TwoLegBetRecord};

/// How often a waiting `try_lock` re-checks the lock.
const LOCK_POLL: Duration = Duration::from_millis(5);

fn guard<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    m.lock().map_err(|_| StoreError::Backend("store mutex poisoned".to_string()))
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// Accounts keyed by (user, site), kept in insertion order.
#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: Mutex<HashMap<(String, String), Vec<AccountCredential>>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store where every account belongs to `user_id`.
    pub fn with_accounts(user_id: &str, accounts: Vec<AccountCredential>) -> Self {
        let store = Self::new();
        for account in accounts {
            store.insert(user_id, account);
        }
        store
    }

    pub fn insert(&self, user_id: &str, account: AccountCredential) {
        if let Ok(mut map) = guard(&self.accounts) {
            map.entry((user_id.to_string(), account.site_id.clone()))
                .or_default()
                .push(account);
        }
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn accounts(&self, user_id: &str, site_id: &str) -> Result<Vec<AccountCredential>, StoreError> {
        let map = guard(&self.accounts)?;
        Ok(map
            .get(&(user_id.to_string(), site_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn update_account(
        &self,
        user_id: &str,
        site_id: &str,
        account_id: &str,
        update: &AccountUpdate,
    ) -> Result<(), StoreError> {
        let mut map = guard(&self.accounts)?;
        let account = map
            .get_mut(&(user_id.to_string(), site_id.to_string()))
            .and_then(|list| list.iter_mut().find(|a| a.account_id == account_id))
            .ok_or_else(|| StoreError::Backend(format!("unknown account {site_id}/{account_id}")))?;
        account.apply(update);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Quota / lock
// ---------------------------------------------------------------------------

struct Entry {
    value: String,
    expires_at: Instant,
}

struct Held {
    token: String,
    expires_at: Instant,
}

/// TTL key-value store with lease locks.
#[derive(Default)]
pub struct MemoryQuotaStore {
    values: Mutex<HashMap<String, Entry>>,
    locks: Mutex<HashMap<String, Held>>,
    /// Number of upcoming `get`/`set` calls that fail, for fault tests.
    failures: AtomicUsize,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` reads or writes fail with a backend error.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> Result<(), StoreError> {
        let took = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match took {
            Ok(_) => Err(StoreError::Backend("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    /// Hold `key` as if another process had locked it.
    pub fn hold_lock(&self, key: &str, lease: Duration) -> Result<LockLease, StoreError> {
        let lease = LockLease::new(key, lease);
        guard(&self.locks)?.insert(
            key.to_string(),
            Held {
                token: lease.token.clone(),
                expires_at: lease.acquired_at + lease.lease,
            },
        );
        Ok(lease)
    }

    fn try_take(&self, key: &str, lease: Duration) -> Result<Option<LockLease>, StoreError> {
        let mut locks = guard(&self.locks)?;
        let now = Instant::now();
        if let Some(held) = locks.get(key) {
            if held.expires_at > now {
                return Ok(None);
            }
        }
        let lease = LockLease::new(key, lease);
        locks.insert(
            key.to_string(),
            Held {
                token: lease.token.clone(),
                expires_at: lease.acquired_at + lease.lease,
            },
        );
        Ok(Some(lease))
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.injected_failure()?;
        let mut values = guard(&self.values)?;
        match values.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        self.injected_failure()?;
        guard(&self.values)?.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn try_lock(&self, key: &str, wait: Duration, lease: Duration) -> Result<Option<LockLease>, StoreError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(held) = self.try_take(key, lease)? {
                return Ok(Some(held));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(LOCK_POLL.min(deadline - now)).await;
        }
    }

    async fn unlock(&self, lease: &LockLease) -> Result<(), StoreError> {
        let mut locks = guard(&self.locks)?;
        if locks.get(&lease.key).is_some_and(|h| h.token == lease.token) {
            locks.remove(&lease.key);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

type HistoryKey = (String, NaiveDate);

/// Bet history in two maps, one per namespace.
#[derive(Default)]
pub struct MemoryHistoryStore {
    permanent: Mutex<HashMap<HistoryKey, BTreeMap<String, TwoLegBetRecord>>>,
    realtime: Mutex<HashMap<HistoryKey, BTreeMap<String, TwoLegBetRecord>>>,
    batch_writes: AtomicUsize,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save_batch` calls so far.
    pub fn batch_writes(&self) -> usize {
        self.batch_writes.load(Ordering::SeqCst)
    }

    fn namespace(&self, ns: Namespace) -> &Mutex<HashMap<HistoryKey, BTreeMap<String, TwoLegBetRecord>>> {
        match ns {
            Namespace::Permanent => &self.permanent,
            Namespace::Realtime => &self.realtime,
        }
    }

    fn write(&self, records: &[TwoLegBetRecord]) -> Result<(), StoreError> {
        for ns in [Namespace::Permanent, Namespace::Realtime] {
            let mut map = guard(self.namespace(ns))?;
            for record in records {
                map.entry((record.user_id.clone(), record.date))
                    .or_default()
                    .insert(record.id.clone(), record.clone());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn save(&self, record: &TwoLegBetRecord) -> Result<(), StoreError> {
        self.write(std::slice::from_ref(record))
    }

    async fn save_batch(&self, records: &[TwoLegBetRecord]) -> Result<(), StoreError> {
        self.batch_writes.fetch_add(1, Ordering::SeqCst);
        self.write(records)
    }

    async fn list(&self, ns: Namespace, user_id: &str, date: NaiveDate) -> Result<Vec<TwoLegBetRecord>, StoreError> {
        let map = guard(self.namespace(ns))?;
        Ok(map
            .get(&(user_id.to_string(), date))
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
