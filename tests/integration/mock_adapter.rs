//! Mock bookmaker for integration testing.
//!
//! Provides a deterministic `SiteAdapter` that quotes at the offered odds,
//! places bets according to a script, and keeps its own unsettled list, all
//! in-memory with no external dependencies.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use hedge_engine::adapters::SiteAdapter;
use hedge_engine::types::*;
use rust_decimal::Decimal;

/// Scripted result of one `place` call.
#[derive(Debug, Clone)]
pub enum PlaceStep {
    Accept,
    Reject(String),
    Timeout,
}

/// A mock bookmaker for deterministic testing.
///
/// Placement follows the queued script; once it runs out every call uses
/// the fallback step.
pub struct MockAdapter {
    site_id: String,
    script: Mutex<VecDeque<PlaceStep>>,
    fallback: Mutex<PlaceStep>,
    /// If set, preview returns no answer.
    silent_preview: Mutex<bool>,
    open: Arc<Mutex<Vec<ExternalBetRecord>>>,
    pub preview_calls: AtomicUsize,
    pub place_calls: AtomicUsize,
    pub unsettled_calls: AtomicUsize,
    pub login_calls: AtomicUsize,
}

impl MockAdapter {
    /// A site that accepts everything.
    pub fn new(site_id: &str) -> Arc<Self> {
        Arc::new(Self {
            site_id: site_id.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(PlaceStep::Accept),
            silent_preview: Mutex::new(false),
            open: Arc::new(Mutex::new(Vec::new())),
            preview_calls: AtomicUsize::new(0),
            place_calls: AtomicUsize::new(0),
            unsettled_calls: AtomicUsize::new(0),
            login_calls: AtomicUsize::new(0),
        })
    }

    /// Queue placement steps, consumed one per `place` call.
    pub fn script(&self, steps: impl IntoIterator<Item = PlaceStep>) {
        self.script.lock().unwrap().extend(steps);
    }

    /// What `place` does once the script is used up.
    pub fn set_fallback(&self, step: PlaceStep) {
        *self.fallback.lock().unwrap() = step;
    }

    pub fn set_silent_preview(&self, silent: bool) {
        *self.silent_preview.lock().unwrap() = silent;
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Bets accepted so far.
    pub fn open_bets(&self) -> Vec<ExternalBetRecord> {
        self.open.lock().unwrap().clone()
    }

    fn next_step(&self) -> PlaceStep {
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.fallback.lock().unwrap().clone())
    }
}

#[async_trait]
impl SiteAdapter for MockAdapter {
    async fn login(&self, credential: &AccountCredential, _params: &LoginParams) -> Result<LoginResult, AdapterError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        Ok(LoginResult {
            success: true,
            token: Some(format!("{}-session-{}", self.site_id, credential.account_id)),
            message: "logged in".to_string(),
        })
    }

    async fn preview(&self, _credential: &AccountCredential, offer: &LegOffer) -> Result<Option<PreviewResult>, AdapterError> {
        self.preview_calls.fetch_add(1, Ordering::SeqCst);
        if *self.silent_preview.lock().unwrap() {
            return Ok(None);
        }
        Ok(Some(PreviewResult {
            success: true,
            odds: offer.odds,
            min_stake: Some(Decimal::ONE),
            max_stake: None,
            ticket: serde_json::json!({ "selection": offer.selection_id }),
            message: "quoted".to_string(),
        }))
    }

    async fn place(
        &self,
        _credential: &AccountCredential,
        offer: &LegOffer,
        preview: &PreviewResult,
    ) -> Result<PlacementResult, AdapterError> {
        let n = self.place_calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.next_step() {
            PlaceStep::Accept => {
                let bet_id = format!("{}-{n:04}", self.site_id.to_uppercase());
                self.open.lock().unwrap().push(ExternalBetRecord {
                    bet_id: format!("EXT/{bet_id}"),
                    status: "open".to_string(),
                    stake: Some(offer.stake),
                    odds: Some(preview.odds),
                    payout: None,
                    raw: serde_json::Value::Null,
                });
                Ok(PlacementResult {
                    success: true,
                    bet_id: Some(bet_id),
                    info: None,
                    message: "accepted".to_string(),
                })
            }
            PlaceStep::Reject(reason) => Ok(PlacementResult {
                success: false,
                bet_id: None,
                info: None,
                message: reason,
            }),
            PlaceStep::Timeout => Err(AdapterError::Timeout(format!("{} did not answer", self.site_id))),
        }
    }

    async fn balance(&self, _credential: &AccountCredential) -> Result<BalanceResult, AdapterError> {
        Ok(BalanceResult {
            success: true,
            balance: Some(Decimal::new(1_000, 0)),
            message: "ok".to_string(),
        })
    }

    async fn unsettled(&self, _credential: &AccountCredential) -> Result<Vec<ExternalBetRecord>, AdapterError> {
        self.unsettled_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.open_bets())
    }
}
