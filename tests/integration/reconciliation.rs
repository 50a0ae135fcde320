//! Reconciliation after a real batch.

use chrono::Utc;
use std::sync::Arc;

use hedge_engine::adapters::{AdapterRegistry, SiteAdapter};
use hedge_engine::engine::reconciler::Reconciler;
use hedge_engine::store::file::FileHistoryStore;
use hedge_engine::store::memory::MemoryAccountStore;
use hedge_engine::store::{HistoryStore, Namespace};
use hedge_engine::types::*;

use crate::harness::{account, candidate, EngineBuilder, USER};
use crate::mock_adapter::MockAdapter;

#[tokio::test]
async fn test_batch_then_reconcile_fetches_each_account_once() {
    let alpha = MockAdapter::new("alpha");
    let beta = MockAdapter::new("beta");
    let engine = EngineBuilder::new()
        .site("alpha", 1, alpha.clone())
        .site("beta", 1, beta.clone())
        .account(account("alpha", "a1"))
        .account(account("beta", "b1"))
        .build();

    let batch = (0..4)
        .map(|i| candidate(&format!("c{i}"), "alpha", "beta", &format!("evt{i}")))
        .collect();
    let report = engine.coordinator.run_batch(batch).await;
    assert_eq!(report.placed_legs(), 8);

    let summary = engine
        .reconciler
        .reconcile_day(USER, Utc::now().date_naive())
        .await
        .unwrap();
    assert_eq!(summary.pairs_fetched, 2);
    assert_eq!(summary.legs_matched, 8);
    assert_eq!(summary.records_written, 4);
    assert_eq!(MockAdapter::calls(&alpha.unsettled_calls), 1);
    assert_eq!(MockAdapter::calls(&beta.unsettled_calls), 1);
    assert_eq!(engine.history.batch_writes(), 1);

    // external ids carry a prefix; the local id is contained in them
    let saved = engine.saved().await;
    for record in &saved {
        let detail = record.leg_a.detail.as_ref().unwrap();
        assert!(detail.bet_id.contains(record.leg_a.bet_id.as_deref().unwrap()));
    }

    // second pass has nothing left to do
    let again = engine
        .reconciler
        .reconcile_day(USER, Utc::now().date_naive())
        .await
        .unwrap();
    assert_eq!(again.pairs_fetched, 0);
    assert_eq!(MockAdapter::calls(&alpha.unsettled_calls), 1);
}

#[tokio::test]
async fn test_reconcile_against_file_history() {
    let root = std::env::temp_dir().join(format!("hedge-reconcile-{}", uuid::Uuid::new_v4()));
    let history = Arc::new(FileHistoryStore::new(root.to_str()));

    let alpha = MockAdapter::new("alpha");
    let mut registry = AdapterRegistry::new();
    registry.register("alpha", alpha.clone());
    let accounts = Arc::new(MemoryAccountStore::with_accounts(USER, vec![account("alpha", "a1")]));

    // one bet the site knows about
    let mut c = candidate("c1", "alpha", "beta", "evt1");
    c.leg_a.stake = rust_decimal_macros::dec!(20);
    let acct = account("alpha", "a1");
    let quote = alpha.preview(&acct, &c.leg_a).await.unwrap().unwrap();
    let placed = alpha.place(&acct, &c.leg_a, &quote).await.unwrap();
    let bet_id = placed.confirmed_id().unwrap().to_string();

    let leg_a = LegResult::with_account(
        &acct,
        LegOutcome::Placed(Placement {
            bet_id: bet_id.clone(),
            info: BetInfo::from_offer(&c.leg_a, quote.odds, c.leg_a.stake),
            placed_at: Utc::now(),
        }),
    );
    let leg_b = LegResult::without_account("beta", LegOutcome::Skipped(SkipReason::PartnerNotPlaced));
    let record = TwoLegBetRecord::new(&c, &leg_a, &leg_b);
    history.save(&record).await.unwrap();

    let reconciler = Reconciler::new(Arc::new(registry), accounts, history.clone());
    let summary = reconciler.reconcile_day(USER, record.date).await.unwrap();
    assert_eq!(summary.legs_matched, 1);

    for ns in [Namespace::Permanent, Namespace::Realtime] {
        let saved = history.list(ns, USER, record.date).await.unwrap();
        assert_eq!(saved.len(), 1);
        let detail = saved[0].leg_a.detail.as_ref().unwrap();
        assert_eq!(detail.bet_id, format!("EXT/{bet_id}"));
        assert_eq!(detail.stake, Some(rust_decimal_macros::dec!(20)));
    }

    let _ = std::fs::remove_dir_all(&root);
}
