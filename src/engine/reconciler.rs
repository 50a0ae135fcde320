//! Settlement reconciliation.
//!
//! Attaches each placed leg's settlement detail from the site's unsettled
//! listing. Every distinct (site, account) is fetched once, all fetches run
//! concurrently, and every updated record goes back in a single batched
//! write.

use chrono::NaiveDate;
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::adapters::AdapterRegistry;
use crate::store::{AccountStore, HistoryStore, Namespace};
use crate::types::{EngineError, ExternalBetRecord, LegSide, StoreError, TwoLegBetRecord};

type AccountKey = (String, String);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub pairs_fetched: usize,
    pub pairs_failed: usize,
    pub legs_matched: usize,
    pub records_written: usize,
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetched {} accounts ({} failed), matched {} legs, wrote {} records",
            self.pairs_fetched, self.pairs_failed, self.legs_matched, self.records_written
        )
    }
}

pub struct Reconciler {
    registry: Arc<AdapterRegistry>,
    accounts: Arc<dyn AccountStore>,
    history: Arc<dyn HistoryStore>,
}

impl Reconciler {
    pub fn new(registry: Arc<AdapterRegistry>, accounts: Arc<dyn AccountStore>, history: Arc<dyn HistoryStore>) -> Self {
        Self {
            registry,
            accounts,
            history,
        }
    }

    /// Reconcile a user's permanent history for one day.
    pub async fn reconcile_day(&self, user_id: &str, date: NaiveDate) -> Result<ReconcileReport, StoreError> {
        let records = self.history.list(Namespace::Permanent, user_id, date).await?;
        self.reconcile(user_id, records).await
    }

    /// Match `records` against the sites and persist the ones that changed.
    /// A failed fetch only leaves its legs for the next pass.
    pub async fn reconcile(&self, user_id: &str, mut records: Vec<TwoLegBetRecord>) -> Result<ReconcileReport, StoreError> {
        let pairs: BTreeSet<AccountKey> = records
            .iter()
            .flat_map(|r| [&r.leg_a, &r.leg_b])
            .filter(|leg| leg.awaiting_detail())
            .filter_map(|leg| Some((leg.site_id.clone(), leg.account_id.clone()?)))
            .collect();

        let mut report = ReconcileReport::default();
        if pairs.is_empty() {
            debug!(user = %user_id, "Nothing to reconcile");
            return Ok(report);
        }

        let fetches = pairs.iter().map(|(site, account)| self.fetch(user_id, site, account));
        let listings: HashMap<AccountKey, Vec<ExternalBetRecord>> = pairs
            .iter()
            .cloned()
            .zip(join_all(fetches).await)
            .filter_map(|(key, listing)| match listing {
                Ok(bets) => Some((key, bets)),
                Err(e) => {
                    warn!(site = %key.0, account = %key.1, error = %e, "Unsettled listing unavailable");
                    None
                }
            })
            .collect();
        report.pairs_fetched = pairs.len();
        report.pairs_failed = pairs.len() - listings.len();

        let mut dirty = Vec::new();
        for record in records.iter_mut() {
            let mut changed = false;
            for side in [LegSide::A, LegSide::B] {
                let leg = record.leg_mut(side);
                if !leg.awaiting_detail() {
                    continue;
                }
                let (Some(bet_id), Some(account)) = (leg.bet_id.as_deref(), leg.account_id.as_deref()) else {
                    continue;
                };
                let Some(bets) = listings.get(&(leg.site_id.clone(), account.to_string())) else {
                    continue;
                };
                if let Some(found) = bets.iter().find(|b| b.bet_id.contains(bet_id)) {
                    leg.detail = Some(found.clone());
                    report.legs_matched += 1;
                    changed = true;
                }
            }
            if changed {
                dirty.push(record.clone());
            }
        }

        if !dirty.is_empty() {
            self.history.save_batch(&dirty).await?;
            report.records_written = dirty.len();
        }
        info!(user = %user_id, summary = %report, "Reconciliation complete");
        Ok(report)
    }

    async fn fetch(&self, user_id: &str, site_id: &str, account_id: &str) -> Result<Vec<ExternalBetRecord>, EngineError> {
        let account = self
            .accounts
            .account(user_id, site_id, account_id)
            .await?
            .ok_or_else(|| EngineError::Config(format!("account {account_id} on {site_id} no longer configured")))?;
        let adapter = self.registry.placement_adapter(&account)?;
        adapter.unsettled(&account).await.map_err(|source| EngineError::Adapter {
            site: site_id.to_string(),
            source,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
