//! HEDGE: two-leg arbitrage bet execution engine
//!
//! Entry point. Loads configuration and accounts, initialises structured
//! logging, executes one batch of candidates read from a JSON file, then
//! reconciles today's history for every user in the batch.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use hedge_engine::adapters::AdapterRegistry;
use hedge_engine::config::AppConfig;
use hedge_engine::engine::coordinator::{BatchSettings, CandidateState, Coordinator};
use hedge_engine::engine::executor::{ExecutionSettings, LegExecutor};
use hedge_engine::engine::reconciler::Reconciler;
use hedge_engine::markers::PlacementMarkers;
use hedge_engine::quota::{LedgerSettings, QuotaLedger};
use hedge_engine::rotation::AccountPool;
use hedge_engine::store::file::FileHistoryStore;
use hedge_engine::store::memory::{MemoryAccountStore, MemoryQuotaStore};
use hedge_engine::store::HistoryStore;
use hedge_engine::types::{AccountCredential, BetCandidate};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("HEDGE_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = AppConfig::load(&config_path)?;

    init_logging();

    let candidates_path = std::env::args()
        .nth(1)
        .context("usage: hedge-engine <candidates.json>")?;
    let candidates = load_candidates(&candidates_path)?;
    info!(
        config = %config_path,
        candidates = candidates.len(),
        sites = cfg.sites.len(),
        unilateral = cfg.engine.unilateral,
        "HEDGE starting up"
    );

    // -- Initialise components -------------------------------------------

    let accounts = Arc::new(load_accounts(&cfg.storage.accounts_file)?);
    let registry = Arc::new(AdapterRegistry::from_config(&cfg)?);
    let quota = Arc::new(MemoryQuotaStore::new());
    let history: Arc<dyn HistoryStore> = Arc::new(FileHistoryStore::new(Some(&cfg.storage.history_dir)));
    let cancel = CancellationToken::new();

    let markers = Arc::new(PlacementMarkers::new(quota.clone(), cfg.engine.quota_ttl()));
    let ledger = Arc::new(QuotaLedger::new(
        quota,
        LedgerSettings::from_config(&cfg.engine),
        cancel.clone(),
    ));
    let executor = Arc::new(LegExecutor::new(
        registry.clone(),
        Arc::new(AccountPool::new(accounts.clone(), cfg.engine.cooldown())),
        ledger,
        ExecutionSettings::from_config(&cfg),
    ));
    let coordinator = Coordinator::new(
        executor,
        markers,
        history.clone(),
        cfg.priorities(),
        BatchSettings::from_config(&cfg),
    );

    // -- Execute ---------------------------------------------------------

    let users: BTreeSet<String> = candidates.iter().map(|c| c.user_id.clone()).collect();

    let report = tokio::select! {
        report = coordinator.run_batch(candidates) => report,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, abandoning batch");
            cancel.cancel();
            return Ok(());
        }
    };
    info!(
        persisted = report.count(CandidateState::Persisted),
        placed_legs = report.placed_legs(),
        failed_legs = report.failed_legs(),
        timed_out = report.timed_out,
        "Batch finished"
    );

    // -- Reconcile -------------------------------------------------------

    let reconciler = Reconciler::new(registry, accounts, history);
    let today = Utc::now().date_naive();
    for user in &users {
        match reconciler.reconcile_day(user, today).await {
            Ok(summary) => info!(user = %user, summary = %summary, "Reconciled"),
            Err(e) => error!(user = %user, error = %e, "Reconciliation failed"),
        }
    }

    info!("HEDGE shut down cleanly");
    Ok(())
}

fn load_candidates(path: &str) -> Result<Vec<BetCandidate>> {
    let contents = fs::read_to_string(path).with_context(|| format!("Failed to read candidates: {path}"))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse candidates: {path}"))
}

/// Accounts file: user id → accounts, all sites mixed.
fn load_accounts(path: &str) -> Result<MemoryAccountStore> {
    let store = MemoryAccountStore::new();
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path, "No accounts file, every leg will be skipped");
            return Ok(store);
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to read accounts: {path}")),
    };
    let by_user: HashMap<String, Vec<AccountCredential>> =
        serde_json::from_str(&contents).with_context(|| format!("Failed to parse accounts: {path}"))?;

    let mut total = 0;
    for (user, accounts) in by_user {
        for account in accounts {
            store.insert(&user, account);
            total += 1;
        }
    }
    info!(path = %path, accounts = total, "Accounts loaded");
    Ok(store)
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("hedge_engine=info"));

    let json_logging = std::env::var("HEDGE_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
