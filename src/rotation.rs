//! Account rotation pool.
//!
//! Round-robin over a user's accounts on a site. Each (user, site) key owns
//! an atomic cursor that starts at a random offset, so concurrent first
//! callers spread across accounts instead of all landing on index 0.
//!
//! For the rate-sensitive odds endpoint the pool also keeps a per-account
//! cooldown: an account used within the window is skipped for the next one
//! in the same pass, and the timestamp is claimed before the call is made.
//!
//! Both maps are process-local and live inside the pool.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::store::AccountStore;
use crate::types::{AccountCredential, StoreError};

pub struct AccountPool {
    store: Arc<dyn AccountStore>,
    cursors: DashMap<(String, String), Arc<AtomicUsize>>,
    cooldowns: DashMap<String, Instant>,
    cooldown: Duration,
}

impl AccountPool {
    pub fn new(store: Arc<dyn AccountStore>, cooldown: Duration) -> Self {
        Self {
            store,
            cursors: DashMap::new(),
            cooldowns: DashMap::new(),
            cooldown,
        }
    }

    pub fn store(&self) -> &Arc<dyn AccountStore> {
        &self.store
    }

    fn cursor(&self, user_id: &str, site_id: &str) -> Arc<AtomicUsize> {
        self.cursors
            .entry((user_id.to_string(), site_id.to_string()))
            .or_insert_with(|| Arc::new(AtomicUsize::new(rand::random::<u32>() as usize)))
            .clone()
    }

    /// Advance the (user, site) cursor over a list of `len` accounts and
    /// return the index to use. `len` must be non-zero.
    pub fn advance(&self, user_id: &str, site_id: &str, len: usize) -> usize {
        let cursor = self.cursor(user_id, site_id);
        let prev = cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some((v % len + 1) % len))
            .unwrap_or_else(|v| v);
        prev % len
    }

    /// The next account in rotation, whatever its state. Callers filter.
    pub async fn next(&self, user_id: &str, site_id: &str) -> Result<Option<AccountCredential>, StoreError> {
        let mut accounts = self.store.accounts(user_id, site_id).await?;
        if accounts.is_empty() {
            return Ok(None);
        }
        let idx = self.advance(user_id, site_id, accounts.len());
        Ok(Some(accounts.swap_remove(idx)))
    }

    /// The next account in rotation that satisfies `usable`. Makes at most
    /// one pass over the list.
    pub async fn next_matching<F>(
        &self,
        user_id: &str,
        site_id: &str,
        usable: F,
    ) -> Result<Option<AccountCredential>, StoreError>
    where
        F: Fn(&AccountCredential) -> bool + Send,
    {
        let mut accounts = self.store.accounts(user_id, site_id).await?;
        for _ in 0..accounts.len() {
            let idx = self.advance(user_id, site_id, accounts.len());
            if usable(&accounts[idx]) {
                return Ok(Some(accounts.swap_remove(idx)));
            }
        }
        Ok(None)
    }

    /// The next usable account for an odds-endpoint call, skipping accounts
    /// still in cooldown. The chosen account's cooldown starts now, whether
    /// or not the call that follows succeeds.
    pub async fn next_for_odds(&self, user_id: &str, site_id: &str) -> Result<Option<AccountCredential>, StoreError> {
        let mut accounts = self.store.accounts(user_id, site_id).await?;
        for _ in 0..accounts.len() {
            let idx = self.advance(user_id, site_id, accounts.len());
            let account = &accounts[idx];
            if !(account.enabled && account.token_valid) {
                continue;
            }
            if self.try_claim(&account.account_name, Instant::now()) {
                return Ok(Some(accounts.swap_remove(idx)));
            }
            debug!(account = %account.account_name, "Account in cooldown, trying next");
        }
        Ok(None)
    }

    /// Claim the account for an odds call at `now` unless it was claimed
    /// within the cooldown window. Check and update are one atomic step.
    pub fn try_claim(&self, account_name: &str, now: Instant) -> bool {
        match self.cooldowns.entry(account_name.to_string()) {
            Entry::Occupied(mut last) => {
                if now.saturating_duration_since(*last.get()) < self.cooldown {
                    return false;
                }
                last.insert(now);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryAccountStore;
    use crate::types::fixtures::account;
    use std::collections::HashMap;

    fn pool(n: usize, cooldown: Duration) -> AccountPool {
        let accounts = (0..n).map(|i| account("s1", &format!("a{i}"))).collect();
        AccountPool::new(Arc::new(MemoryAccountStore::with_accounts("u1", accounts)), cooldown)
    }

    #[tokio::test]
    async fn test_rotation_is_fair() {
        let pool = pool(4, Duration::ZERO);
        let mut seen: HashMap<String, usize> = HashMap::new();
        for _ in 0..400 {
            let a = pool.next("u1", "s1").await.unwrap().unwrap();
            *seen.entry(a.account_id).or_default() += 1;
        }
        assert_eq!(seen.len(), 4);
        assert!(seen.values().all(|&n| n == 100), "{seen:?}");
    }

    #[tokio::test]
    async fn test_consecutive_calls_cycle_in_order() {
        let pool = pool(3, Duration::ZERO);
        let first = pool.next("u1", "s1").await.unwrap().unwrap().account_id;
        let start: usize = first[1..].parse().unwrap();
        for step in 1..6 {
            let a = pool.next("u1", "s1").await.unwrap().unwrap();
            assert_eq!(a.account_id, format!("a{}", (start + step) % 3));
        }
    }

    #[tokio::test]
    async fn test_no_accounts() {
        let pool = pool(0, Duration::ZERO);
        assert!(pool.next("u1", "s1").await.unwrap().is_none());
        assert!(pool.next_for_odds("u1", "s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_advance_loses_no_updates() {
        let pool = Arc::new(pool(5, Duration::ZERO));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                (0..100).map(|_| pool.advance("u1", "s1", 5)).collect::<Vec<_>>()
            }));
        }
        let mut counts = [0usize; 5];
        for h in handles {
            for idx in h.await.unwrap() {
                counts[idx] += 1;
            }
        }
        assert_eq!(counts, [200; 5]);
    }

    #[tokio::test]
    async fn test_next_matching_skips_unusable() {
        let mut accounts: Vec<_> = (0..3).map(|i| account("s1", &format!("a{i}"))).collect();
        accounts[0].enabled = false;
        accounts[2].enabled = false;
        let pool = AccountPool::new(
            Arc::new(MemoryAccountStore::with_accounts("u1", accounts)),
            Duration::ZERO,
        );
        for _ in 0..5 {
            let a = pool.next_matching("u1", "s1", |a| a.enabled).await.unwrap().unwrap();
            assert_eq!(a.account_id, "a1");
        }
        assert!(pool.next_matching("u1", "s1", |_| false).await.unwrap().is_none());
    }

    #[test]
    fn test_cooldown_claim() {
        let pool = pool(1, Duration::from_secs(2));
        let t0 = Instant::now();
        assert!(pool.try_claim("acct", t0));
        assert!(!pool.try_claim("acct", t0 + Duration::from_millis(1999)));
        assert!(pool.try_claim("acct", t0 + Duration::from_secs(2)));
        assert!(pool.try_claim("other", t0));
    }

    #[tokio::test]
    async fn test_odds_rotation_skips_cooling_accounts_in_same_pass() {
        let pool = pool(2, Duration::from_secs(60));
        let first = pool.next_for_odds("u1", "s1").await.unwrap().unwrap();
        let second = pool.next_for_odds("u1", "s1").await.unwrap().unwrap();
        assert_ne!(first.account_id, second.account_id);
        // both cooling: nobody available, no waiting
        assert!(pool.next_for_odds("u1", "s1").await.unwrap().is_none());
    }
}
