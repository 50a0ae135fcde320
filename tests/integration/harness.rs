//! Wires a complete engine over in-memory stores and mock sites.

use chrono::Utc;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use hedge_engine::adapters::{AdapterRegistry, SiteAdapter};
use hedge_engine::engine::coordinator::{BatchSettings, Coordinator};
use hedge_engine::engine::executor::{ExecutionSettings, LegExecutor};
use hedge_engine::engine::reconciler::Reconciler;
use hedge_engine::markers::PlacementMarkers;
use hedge_engine::quota::{LedgerSettings, QuotaLedger, QuotaLimits};
use hedge_engine::retry::RetryPolicy;
use hedge_engine::rotation::AccountPool;
use hedge_engine::store::memory::{MemoryAccountStore, MemoryHistoryStore, MemoryQuotaStore};
use hedge_engine::store::{HistoryStore, Namespace};
use hedge_engine::types::*;

pub const USER: &str = "u1";

pub struct Engine {
    pub coordinator: Coordinator,
    pub reconciler: Reconciler,
    pub ledger: Arc<QuotaLedger>,
    pub accounts: Arc<MemoryAccountStore>,
    pub history: Arc<MemoryHistoryStore>,
}

pub struct EngineBuilder {
    sites: Vec<(String, u32, Arc<dyn SiteAdapter>)>,
    accounts: Vec<AccountCredential>,
    limits: QuotaLimits,
    unilateral: bool,
    min_interval: chrono::Duration,
    timeout: Duration,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            sites: Vec::new(),
            accounts: Vec::new(),
            limits: QuotaLimits {
                per_score: 10,
                per_event: 10,
            },
            unilateral: false,
            min_interval: chrono::Duration::zero(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn site(mut self, id: &str, priority: u32, adapter: Arc<dyn SiteAdapter>) -> Self {
        self.sites.push((id.to_string(), priority, adapter));
        self
    }

    pub fn account(mut self, account: AccountCredential) -> Self {
        self.accounts.push(account);
        self
    }

    pub fn limits(mut self, per_score: u32, per_event: u32) -> Self {
        self.limits = QuotaLimits { per_score, per_event };
        self
    }

    pub fn unilateral(mut self) -> Self {
        self.unilateral = true;
        self
    }

    pub fn min_interval(mut self, interval: chrono::Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Engine {
        let mut registry = AdapterRegistry::new();
        let mut priorities = HashMap::new();
        for (id, priority, adapter) in self.sites {
            registry.register(&id, adapter);
            priorities.insert(id, priority);
        }
        let registry = Arc::new(registry);

        let accounts = Arc::new(MemoryAccountStore::with_accounts(USER, self.accounts));
        let quota = Arc::new(MemoryQuotaStore::new());
        let history = Arc::new(MemoryHistoryStore::new());
        let markers = Arc::new(PlacementMarkers::new(quota.clone(), Duration::from_secs(3_600)));
        let ledger = Arc::new(QuotaLedger::new(
            quota,
            LedgerSettings {
                transport: RetryPolicy::immediate(3),
                ..LedgerSettings::default()
            },
            CancellationToken::new(),
        ));

        let executor = LegExecutor::new(
            registry.clone(),
            Arc::new(AccountPool::new(accounts.clone(), Duration::ZERO)),
            ledger.clone(),
            ExecutionSettings {
                preview: RetryPolicy::immediate(10),
                placement: RetryPolicy::immediate(10),
                limits: self.limits,
                min_interval: self.min_interval,
                unilateral: self.unilateral,
            },
        );
        let coordinator = Coordinator::new(
            Arc::new(executor),
            markers,
            history.clone(),
            priorities,
            BatchSettings {
                parallelism: 4,
                pool_cap: 100,
                backlog: 1_000,
                timeout: self.timeout,
            },
        );
        let reconciler = Reconciler::new(registry, accounts.clone(), history.clone());

        Engine {
            coordinator,
            reconciler,
            ledger,
            accounts,
            history,
        }
    }
}

impl Engine {
    pub async fn saved(&self) -> Vec<TwoLegBetRecord> {
        self.history
            .list(Namespace::Permanent, USER, Utc::now().date_naive())
            .await
            .unwrap()
    }
}

pub fn account(site: &str, id: &str) -> AccountCredential {
    AccountCredential {
        site_id: site.to_string(),
        account_id: id.to_string(),
        account_name: format!("{site}-{id}"),
        enabled: true,
        auto_login: false,
        token_valid: true,
        token: Some("tok".to_string()),
        stake_multiplier: dec!(1),
        simulate: false,
        last_balance: None,
        last_message: None,
    }
}

pub fn offer(site: &str, event: &str, score: &str) -> LegOffer {
    LegOffer {
        site_id: site.to_string(),
        event_id: event.to_string(),
        market_id: "cs".to_string(),
        selection_id: score.to_string(),
        odds: dec!(3.40),
        score: score.to_string(),
        is_latest: true,
        stake: dec!(50),
        league: "Serie A".to_string(),
        home_team: "Roma".to_string(),
        away_team: "Lazio".to_string(),
        market_name: "Correct Score".to_string(),
    }
}

pub fn candidate(id: &str, site_a: &str, site_b: &str, event: &str) -> BetCandidate {
    BetCandidate {
        id: id.to_string(),
        user_id: USER.to_string(),
        leg_a: offer(site_a, event, "2-1"),
        leg_b: offer(site_b, event, "2-1"),
    }
}
