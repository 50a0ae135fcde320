//! Quota reservation ledger.
//!
//! Per (user, event) counters of bets per final score, stored as one JSON
//! object under [`quota_key`](crate::store::quota_key). A slot is reserved
//! before a leg is placed and handed back if placement never succeeds.
//!
//! Both operations run under the store's lease lock and keep the critical
//! section to the read-modify-write. If the lease runs out before the write,
//! the write is dropped: another caller may already hold the lock.
//!
//! Failure policy:
//! - `reserve` fails closed: lock timeout or store failure means "no slot".
//! - `rollback` fails open: it logs and returns. A missed rollback only
//!   leaves quota unused.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::retry::{retry_transport, RetryPolicy};
use crate::store::{LockLease, QuotaStore};
use crate::types::StoreError;

/// Caps enforced by [`QuotaLedger::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub per_score: u32,
    pub per_event: u32,
}

/// Reserved bets per score for one (user, event). An absent counter is the
/// same as an empty one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuotaCounter(BTreeMap<String, u32>);

impl QuotaCounter {
    pub fn count(&self, score: &str) -> u32 {
        self.0.get(score).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.0.values().sum()
    }

    /// Whether one more bet on `score` stays within `limits`.
    pub fn admits(&self, score: &str, limits: &QuotaLimits) -> bool {
        self.count(score) < limits.per_score && self.total() < limits.per_event
    }

    pub fn increment(&mut self, score: &str) {
        *self.0.entry(score.to_string()).or_insert(0) += 1;
    }

    /// Decrement if positive. Returns whether anything changed.
    pub fn decrement(&mut self, score: &str) -> bool {
        match self.0.get_mut(score) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

impl fmt::Display for QuotaCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(s, n)| format!("{s}:{n}")).collect();
        write!(f, "{{{}}} total={}", parts.join(", "), self.total())
    }
}

/// Lock and retention timings.
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub lock_wait: Duration,
    pub lock_lease: Duration,
    pub ttl: Duration,
    /// Retry on plain store transport failures.
    pub transport: RetryPolicy,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_secs(2),
            lock_lease: Duration::from_secs(5),
            ttl: Duration::from_secs(24 * 3_600),
            transport: RetryPolicy::new(10, Duration::from_millis(300)),
        }
    }
}

impl LedgerSettings {
    pub fn from_config(engine: &EngineConfig) -> Self {
        Self {
            lock_wait: engine.lock_wait(),
            lock_lease: engine.lock_lease(),
            ttl: engine.quota_ttl(),
            transport: engine.transport_policy(),
        }
    }
}

/// What happened inside one locked attempt.
enum Locked<T> {
    Done(T),
    LockTimeout,
    LeaseLost,
}

pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    settings: LedgerSettings,
    cancel: CancellationToken,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn QuotaStore>, settings: LedgerSettings, cancel: CancellationToken) -> Self {
        Self { store, settings, cancel }
    }

    /// Current counter under `key`, read without locking.
    pub async fn counter(&self, key: &str) -> Result<QuotaCounter, StoreError> {
        load(self.store.as_ref(), key).await
    }

    /// Reserve one slot for `score`. `false` means no slot: limits reached,
    /// lock not acquired in time, or the store kept failing.
    pub async fn reserve(&self, key: &str, score: &str, limits: &QuotaLimits) -> bool {
        let result = retry_transport(&self.settings.transport, "quota.reserve", &self.cancel, || {
            self.locked(key, move |counter| {
                if counter.admits(score, limits) {
                    counter.increment(score);
                    true
                } else {
                    false
                }
            })
        })
        .await;

        match result {
            Ok(Locked::Done(true)) => {
                debug!(key, score, "Quota slot reserved");
                true
            }
            Ok(Locked::Done(false)) => {
                info!(key, score, per_score = limits.per_score, per_event = limits.per_event, "Quota exhausted");
                false
            }
            Ok(Locked::LockTimeout) => {
                warn!(key, score, "Quota lock not acquired, refusing to reserve");
                false
            }
            Ok(Locked::LeaseLost) => {
                warn!(key, score, "Quota lease expired mid-update, reservation dropped");
                false
            }
            Err(e) => {
                warn!(key, score, error = %e, "Quota store unavailable, refusing to reserve");
                false
            }
        }
    }

    /// Hand back one slot for `score`. Never fails; problems are logged.
    pub async fn rollback(&self, key: &str, score: &str) {
        let result = retry_transport(&self.settings.transport, "quota.rollback", &self.cancel, || {
            self.locked(key, move |counter| counter.decrement(score))
        })
        .await;

        match result {
            Ok(Locked::Done(true)) => debug!(key, score, "Quota slot rolled back"),
            Ok(Locked::Done(false)) => debug!(key, score, "Nothing to roll back"),
            Ok(Locked::LockTimeout) => warn!(key, score, "Quota lock not acquired, rollback skipped"),
            Ok(Locked::LeaseLost) => warn!(key, score, "Quota lease expired mid-update, rollback skipped"),
            Err(e) => warn!(key, score, error = %e, "Quota rollback failed"),
        }
    }

    /// Lock `key`, apply `mutate` to the counter, persist if it reports a
    /// change, unlock.
    async fn locked<F>(&self, key: &str, mutate: F) -> Result<Locked<bool>, StoreError>
    where
        F: Fn(&mut QuotaCounter) -> bool,
    {
        let lease = match self
            .store
            .try_lock(key, self.settings.lock_wait, self.settings.lock_lease)
            .await?
        {
            Some(lease) => lease,
            None => return Ok(Locked::LockTimeout),
        };

        let result = self.read_modify_write(&lease, mutate).await;
        if let Err(e) = self.store.unlock(&lease).await {
            // the lease expires on its own
            warn!(key, error = %e, "Failed to release quota lock");
        }
        result
    }

    async fn read_modify_write<F>(&self, lease: &LockLease, mutate: F) -> Result<Locked<bool>, StoreError>
    where
        F: Fn(&mut QuotaCounter) -> bool,
    {
        let mut counter = load(self.store.as_ref(), &lease.key).await?;
        if !mutate(&mut counter) {
            return Ok(Locked::Done(false));
        }
        if lease.is_expired() {
            return Ok(Locked::LeaseLost);
        }
        let json = serde_json::to_string(&counter)?;
        self.store.set(&lease.key, json, self.settings.ttl).await?;
        Ok(Locked::Done(true))
    }
}

async fn load(store: &dyn QuotaStore, key: &str) -> Result<QuotaCounter, StoreError> {
    match store.get(key).await? {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(QuotaCounter::default()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
