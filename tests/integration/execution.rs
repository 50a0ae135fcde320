//! End-to-end batch execution against mock sites.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hedge_engine::adapters::SiteAdapter;
use hedge_engine::engine::coordinator::CandidateState;
use hedge_engine::store::{quota_key, AccountStore};
use hedge_engine::types::*;

use crate::harness::{account, candidate, EngineBuilder, USER};
use crate::mock_adapter::{MockAdapter, PlaceStep};

#[tokio::test]
async fn test_both_legs_placed_and_recorded() {
    let alpha = MockAdapter::new("alpha");
    let beta = MockAdapter::new("beta");
    let engine = EngineBuilder::new()
        .site("alpha", 1, alpha.clone())
        .site("beta", 2, beta.clone())
        .account(account("alpha", "a1"))
        .account(account("beta", "b1"))
        .build();

    let report = engine
        .coordinator
        .run_batch(vec![candidate("c1", "alpha", "beta", "evt1")])
        .await;
    assert_eq!(report.count(CandidateState::Persisted), 1);
    assert_eq!(report.placed_legs(), 2);

    let saved = engine.saved().await;
    assert_eq!(saved.len(), 1);
    assert!(saved[0].leg_a.success);
    assert!(saved[0].leg_b.success);
    assert_eq!(saved[0].leg_a.bet_id.as_deref(), Some("ALPHA-0001"));
    assert_eq!(saved[0].leg_a.account_name.as_deref(), Some("alpha-a1"));

    let counter = engine.ledger.counter(&quota_key(USER, "evt1")).await.unwrap();
    assert_eq!(counter.count("2-1"), 2);

    let a1 = engine.accounts.account(USER, "alpha", "a1").await.unwrap().unwrap();
    assert_eq!(a1.last_message.as_deref(), Some("placed ALPHA-0001"));
}

#[tokio::test]
async fn test_failed_first_leg_never_dispatches_second() {
    let alpha = MockAdapter::new("alpha");
    alpha.set_fallback(PlaceStep::Timeout);
    let beta = MockAdapter::new("beta");
    let engine = EngineBuilder::new()
        .site("alpha", 1, alpha.clone())
        .site("beta", 2, beta.clone())
        .account(account("alpha", "a1"))
        .account(account("beta", "b1"))
        .build();

    let report = engine
        .coordinator
        .run_batch(vec![candidate("c1", "alpha", "beta", "evt1")])
        .await;

    assert_eq!(MockAdapter::calls(&alpha.place_calls), 10);
    assert_eq!(MockAdapter::calls(&beta.preview_calls), 0);
    assert_eq!(MockAdapter::calls(&beta.place_calls), 0);

    let c = &report.candidates[0];
    assert!(matches!(
        c.leg_b.as_ref().unwrap().outcome,
        LegOutcome::Skipped(SkipReason::PartnerNotPlaced)
    ));

    let saved = engine.saved().await;
    assert_eq!(saved.len(), 1);
    assert!(!saved[0].leg_a.success);
    assert!(!saved[0].leg_b.success);
    assert_eq!(saved[0].leg_b.bet_id, None);

    // rolled back
    let counter = engine.ledger.counter(&quota_key(USER, "evt1")).await.unwrap();
    assert_eq!(counter.total(), 0);
}

#[tokio::test]
async fn test_equal_priority_dispatches_both_legs() {
    let alpha = MockAdapter::new("alpha");
    alpha.set_silent_preview(true);
    let beta = MockAdapter::new("beta");
    let engine = EngineBuilder::new()
        .site("alpha", 1, alpha.clone())
        .site("beta", 1, beta.clone())
        .account(account("alpha", "a1"))
        .account(account("beta", "b1"))
        .build();

    let report = engine
        .coordinator
        .run_batch(vec![candidate("c1", "alpha", "beta", "evt1")])
        .await;

    assert_eq!(MockAdapter::calls(&alpha.preview_calls), 10);
    assert_eq!(MockAdapter::calls(&beta.place_calls), 1);
    assert_eq!(report.one_sided().len(), 1);
}

#[tokio::test]
async fn test_min_interval_spaces_candidates_not_legs() {
    let alpha = MockAdapter::new("alpha");
    let beta = MockAdapter::new("beta");
    let engine = EngineBuilder::new()
        .site("alpha", 1, alpha.clone())
        .site("beta", 2, beta.clone())
        .account(account("alpha", "a1"))
        .account(account("beta", "b1"))
        .min_interval(chrono::Duration::seconds(60))
        .build();

    let report = engine
        .coordinator
        .run_batch(vec![candidate("c1", "alpha", "beta", "evt1")])
        .await;
    assert_eq!(report.placed_legs(), 2);
    assert!(report.one_sided().is_empty());

    let report = engine
        .coordinator
        .run_batch(vec![candidate("c2", "alpha", "beta", "evt1")])
        .await;
    assert_eq!(report.placed_legs(), 0);
    assert_eq!(report.skipped_legs(), 2);
    assert_eq!(MockAdapter::calls(&alpha.place_calls), 1);
    assert_eq!(MockAdapter::calls(&beta.place_calls), 1);

    // a different event is not held back
    let report = engine
        .coordinator
        .run_batch(vec![candidate("c3", "alpha", "beta", "evt2")])
        .await;
    assert_eq!(report.placed_legs(), 2);
}

#[tokio::test]
async fn test_rejections_then_acceptance() {
    let alpha = MockAdapter::new("alpha");
    alpha.script([
        PlaceStep::Reject("odds changed".to_string()),
        PlaceStep::Timeout,
        PlaceStep::Accept,
    ]);
    let engine = EngineBuilder::new()
        .site("alpha", 1, alpha.clone())
        .site("beta", 2, MockAdapter::new("beta"))
        .account(account("alpha", "a1"))
        .account(account("beta", "b1"))
        .build();

    let report = engine
        .coordinator
        .run_batch(vec![candidate("c1", "alpha", "beta", "evt1")])
        .await;
    assert_eq!(MockAdapter::calls(&alpha.place_calls), 3);
    assert_eq!(report.placed_legs(), 2);
}

#[tokio::test]
async fn test_quota_caps_a_batch() {
    let alpha = MockAdapter::new("alpha");
    let beta = MockAdapter::new("beta");
    let engine = EngineBuilder::new()
        .site("alpha", 1, alpha.clone())
        .site("beta", 1, beta.clone())
        .account(account("alpha", "a1"))
        .account(account("alpha", "a2"))
        .account(account("beta", "b1"))
        .limits(3, 3)
        .build();

    let batch = (0..5)
        .map(|i| candidate(&format!("c{i}"), "alpha", "beta", "evt1"))
        .collect();
    let report = engine.coordinator.run_batch(batch).await;

    assert_eq!(report.placed_legs(), 3);
    let counter = engine.ledger.counter(&quota_key(USER, "evt1")).await.unwrap();
    assert_eq!(counter.total(), 3);
    let exhausted = report
        .candidates
        .iter()
        .flat_map(|c| [c.leg_a.as_ref(), c.leg_b.as_ref()])
        .flatten()
        .filter(|l| matches!(l.outcome, LegOutcome::Skipped(SkipReason::QuotaExhausted)))
        .count();
    assert_eq!(exhausted, 7);
}

#[tokio::test]
async fn test_unilateral_batch_skips_stale_odds() {
    let alpha = MockAdapter::new("alpha");
    let beta = MockAdapter::new("beta");
    let engine = EngineBuilder::new()
        .site("alpha", 1, alpha.clone())
        .site("beta", 1, beta.clone())
        .account(account("alpha", "a1"))
        .account(account("beta", "b1"))
        .unilateral()
        .build();

    let mut c = candidate("c1", "alpha", "beta", "evt1");
    c.leg_b.is_latest = false;
    let report = engine.coordinator.run_batch(vec![c]).await;

    assert_eq!(MockAdapter::calls(&beta.preview_calls), 0);
    assert!(matches!(
        report.candidates[0].leg_b.as_ref().unwrap().outcome,
        LegOutcome::Skipped(SkipReason::NotLatestOdds)
    ));
    assert!(report.candidates[0].leg_a.as_ref().unwrap().outcome.is_placed());
    let counter = engine.ledger.counter(&quota_key(USER, "evt1")).await.unwrap();
    assert_eq!(counter.total(), 1);
}

#[tokio::test]
async fn test_simulate_only_account_never_hits_the_site() {
    let alpha = MockAdapter::new("alpha");
    let mut sim = account("alpha", "a1");
    sim.simulate = true;
    let engine = EngineBuilder::new()
        .site("alpha", 1, alpha.clone())
        .site("beta", 2, MockAdapter::new("beta"))
        .account(sim)
        .account(account("beta", "b1"))
        .build();

    let report = engine
        .coordinator
        .run_batch(vec![candidate("c1", "alpha", "beta", "evt1")])
        .await;

    assert_eq!(MockAdapter::calls(&alpha.preview_calls), 1);
    assert_eq!(MockAdapter::calls(&alpha.place_calls), 0);
    assert_eq!(report.placed_legs(), 2);
    let saved = engine.saved().await;
    assert!(saved[0].leg_a.bet_id.as_deref().unwrap().starts_with("sim-"));
}

#[tokio::test]
async fn test_stuck_batch_times_out() {
    struct Stuck;

    #[async_trait]
    impl SiteAdapter for Stuck {
        async fn login(
            &self,
            _: &AccountCredential,
            _: &LoginParams,
        ) -> Result<LoginResult, AdapterError> {
            unreachable!()
        }
        async fn preview(
            &self,
            _: &AccountCredential,
            _: &LegOffer,
        ) -> Result<Option<PreviewResult>, AdapterError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }
        async fn place(
            &self,
            _: &AccountCredential,
            _: &LegOffer,
            _: &PreviewResult,
        ) -> Result<PlacementResult, AdapterError> {
            unreachable!()
        }
        async fn balance(
            &self,
            _: &AccountCredential,
        ) -> Result<BalanceResult, AdapterError> {
            unreachable!()
        }
        async fn unsettled(
            &self,
            _: &AccountCredential,
        ) -> Result<Vec<ExternalBetRecord>, AdapterError> {
            unreachable!()
        }
    }

    let engine = EngineBuilder::new()
        .site("alpha", 1, Arc::new(Stuck))
        .site("beta", 1, Arc::new(Stuck))
        .account(account("alpha", "a1"))
        .account(account("beta", "b1"))
        .batch_timeout(Duration::from_millis(200))
        .build();

    let report = engine
        .coordinator
        .run_batch(vec![candidate("c1", "alpha", "beta", "evt1")])
        .await;
    assert!(report.timed_out);
    assert_eq!(report.count(CandidateState::TimedOut), 1);
    assert_eq!(report.failed_legs(), 2);

    let saved = engine.saved().await;
    assert_eq!(saved.len(), 1);
    assert!(!saved[0].leg_a.success);
    assert!(!saved[0].leg_b.success);

    // the same candidate is never picked up again
    let again = engine
        .coordinator
        .run_batch(vec![candidate("c1", "alpha", "beta", "evt1")])
        .await;
    assert!(!again.timed_out);
    assert_eq!(again.count(CandidateState::AlreadyConsumed), 1);
}
