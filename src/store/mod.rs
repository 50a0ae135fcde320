//! Collaborator stores.
//!
//! The engine reads and writes three external stores through these traits:
//! - [`AccountStore`]: bookmaker accounts per (user, site), with
//!   read-modify-write of a single account.
//! - [`QuotaStore`]: a TTL key-value store plus a lease-based lock, shared
//!   across processes.
//! - [`HistoryStore`]: two-leg bet records in a permanent and a realtime
//!   namespace, partitioned by (user, date).
//!
//! `memory` holds in-process implementations of all three; `file` holds a
//! JSON-file bet history.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use chrono::NaiveDate;
use std::time::{Duration, Instant};

use crate::types::{AccountCredential, AccountUpdate, StoreError, TwoLegBetRecord};

/// Account/config store.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// All accounts a user holds on a site, in store order.
    async fn accounts(&self, user_id: &str, site_id: &str) -> Result<Vec<AccountCredential>, StoreError>;

    /// One account by id.
    async fn account(
        &self,
        user_id: &str,
        site_id: &str,
        account_id: &str,
    ) -> Result<Option<AccountCredential>, StoreError> {
        Ok(self
            .accounts(user_id, site_id)
            .await?
            .into_iter()
            .find(|a| a.account_id == account_id))
    }

    /// Write back execution-observed fields on one account.
    async fn update_account(
        &self,
        user_id: &str,
        site_id: &str,
        account_id: &str,
        update: &AccountUpdate,
    ) -> Result<(), StoreError>;
}

/// A held lock. Expires on its own after `lease`, so a crashed holder
/// cannot block others forever.
#[derive(Debug, Clone)]
pub struct LockLease {
    pub key: String,
    pub token: String,
    pub acquired_at: Instant,
    pub lease: Duration,
}

impl LockLease {
    pub fn new(key: &str, lease: Duration) -> Self {
        Self {
            key: key.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            acquired_at: Instant::now(),
            lease,
        }
    }

    /// Whether the lease ran out; another caller may hold the lock now.
    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.lease
    }
}

/// Quota/lock store.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Overwrite `key`, expiring it after `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    /// Wait up to `wait` for the lock on `key`. `Ok(None)` means the wait
    /// ran out.
    async fn try_lock(&self, key: &str, wait: Duration, lease: Duration) -> Result<Option<LockLease>, StoreError>;

    /// Release a lock. Releasing a lease that already expired (and may have
    /// been taken by someone else) must leave the new holder alone.
    async fn unlock(&self, lease: &LockLease) -> Result<(), StoreError>;
}

/// The two history namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Per-day history of record.
    Permanent,
    /// Mirror read by live views.
    Realtime,
}

/// Bet history store.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Overwrite a record in both namespaces.
    async fn save(&self, record: &TwoLegBetRecord) -> Result<(), StoreError>;

    /// Overwrite many records in both namespaces in one operation.
    async fn save_batch(&self, records: &[TwoLegBetRecord]) -> Result<(), StoreError>;

    /// Every record for (user, date) in a namespace.
    async fn list(&self, ns: Namespace, user_id: &str, date: NaiveDate) -> Result<Vec<TwoLegBetRecord>, StoreError>;
}

/// Key of the quota counter and its lock for (user, event).
pub fn quota_key(user_id: &str, event_id: &str) -> String {
    format!("bet:quota:{user_id}:{event_id}")
}

/// Key of the last successful placement time for (user, event).
pub fn last_placement_key(user_id: &str, event_id: &str) -> String {
    format!("bet:last:{user_id}:{event_id}")
}

/// Key of the consumed marker for a candidate.
pub fn consumed_key(user_id: &str, candidate_id: &str) -> String {
    format!("bet:consumed:{user_id}:{candidate_id}")
}
