//! Simulated bookmaker.
//!
//! Accepts every quote at the offered odds, issues `sim-` bet ids and keeps
//! its own ledger of open bets and balances, so a whole batch plus
//! reconciliation can run without touching a real site. Simulate-only
//! accounts are always routed here for placement.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;

use super::SiteAdapter;
use crate::types::{
    AccountCredential, AdapterError, BalanceResult, BetInfo, ExternalBetRecord, LegOffer, LoginParams,
    LoginResult, PlacementResult, PreviewResult,
};

/// Balance every simulated account starts with.
const STARTING_BALANCE: Decimal = dec!(10000);

#[derive(Default)]
struct Book {
    balances: HashMap<String, Decimal>,
    open: HashMap<String, Vec<ExternalBetRecord>>,
}

pub struct SimulatedAdapter {
    book: Mutex<Book>,
    starting_balance: Decimal,
}

impl Default for SimulatedAdapter {
    fn default() -> Self {
        Self::new(STARTING_BALANCE)
    }
}

impl SimulatedAdapter {
    pub fn new(starting_balance: Decimal) -> Self {
        Self {
            book: Mutex::new(Book::default()),
            starting_balance,
        }
    }

    fn account_key(credential: &AccountCredential) -> String {
        format!("{}/{}", credential.site_id, credential.account_id)
    }

    fn with_book<T>(&self, f: impl FnOnce(&mut Book) -> T) -> Result<T, AdapterError> {
        let mut book = self
            .book
            .lock()
            .map_err(|_| AdapterError::Other("simulated book poisoned".to_string()))?;
        Ok(f(&mut book))
    }
}

#[async_trait]
impl SiteAdapter for SimulatedAdapter {
    async fn login(&self, credential: &AccountCredential, _params: &LoginParams) -> Result<LoginResult, AdapterError> {
        Ok(LoginResult {
            success: true,
            token: Some(format!("sim-token-{}", credential.account_id)),
            message: "simulated login".to_string(),
        })
    }

    async fn preview(&self, _credential: &AccountCredential, offer: &LegOffer) -> Result<Option<PreviewResult>, AdapterError> {
        Ok(Some(PreviewResult {
            success: true,
            odds: offer.odds,
            min_stake: None,
            max_stake: None,
            ticket: serde_json::json!({ "market": offer.market_id, "selection": offer.selection_id }),
            message: "simulated quote".to_string(),
        }))
    }

    async fn place(
        &self,
        credential: &AccountCredential,
        offer: &LegOffer,
        preview: &PreviewResult,
    ) -> Result<PlacementResult, AdapterError> {
        let key = Self::account_key(credential);
        let starting = self.starting_balance;
        let stake = offer.stake;

        let placed = self.with_book(|book| {
            let balance = book.balances.entry(key.clone()).or_insert(starting);
            if *balance < stake {
                return None;
            }
            *balance -= stake;

            let bet_id = format!("sim-{}", uuid::Uuid::new_v4());
            book.open.entry(key.clone()).or_default().push(ExternalBetRecord {
                bet_id: bet_id.clone(),
                status: "pending".to_string(),
                stake: Some(stake),
                odds: Some(preview.odds),
                payout: None,
                raw: serde_json::json!({ "placed_at": Utc::now().to_rfc3339(), "event": offer.event_id }),
            });
            Some(bet_id)
        })?;

        Ok(match placed {
            Some(bet_id) => {
                info!(account = %credential.account_name, bet_id = %bet_id, stake = %stake, "[SIMULATED] Bet placed");
                PlacementResult {
                    success: true,
                    bet_id: Some(bet_id),
                    info: Some(BetInfo::from_offer(offer, preview.odds, stake)),
                    message: "simulated placement".to_string(),
                }
            }
            None => PlacementResult {
                success: false,
                bet_id: None,
                info: None,
                message: "insufficient simulated balance".to_string(),
            },
        })
    }

    async fn balance(&self, credential: &AccountCredential) -> Result<BalanceResult, AdapterError> {
        let key = Self::account_key(credential);
        let starting = self.starting_balance;
        let balance = self.with_book(|book| *book.balances.get(&key).unwrap_or(&starting))?;
        Ok(BalanceResult {
            success: true,
            balance: Some(balance),
            message: "simulated balance".to_string(),
        })
    }

    async fn unsettled(&self, credential: &AccountCredential) -> Result<Vec<ExternalBetRecord>, AdapterError> {
        let key = Self::account_key(credential);
        self.with_book(|book| book.open.get(&key).cloned().unwrap_or_default())
    }
}
