//! Leg executor.
//!
//! Drives one leg of a candidate from gates to confirmed placement and
//! reduces everything that can happen on the way to a [`LegOutcome`]:
//!
//! 1. unilateral gate (odds must be flagged latest)
//! 2. adapter and account selection, auto-login if needed
//! 3. preview, retried while the site gives no answer
//! 4. stake sizing against the quote
//! 5. quota reservation
//! 6. placement, retried until a bet id comes back; rolls the quota back
//!    if it never does
//!
//! The minimum-interval gate belongs to the whole candidate and lives in
//! the coordinator.

use chrono::Utc;
use rust_decimal::Decimal;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::adapters::{AdapterRegistry, SiteAdapter};
use crate::config::AppConfig;
use crate::quota::{QuotaLedger, QuotaLimits};
use crate::retry::{retry_until_done, retry_until_some, Attempt, RetryPolicy};
use crate::rotation::AccountPool;
use crate::store::quota_key;
use crate::types::{
    AccountCredential, AccountUpdate, AdapterError, BetInfo, LegOffer, LegOutcome, LegResult, LoginParams,
    Placement, PreviewResult, SkipReason, Stage,
};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub preview: RetryPolicy,
    pub placement: RetryPolicy,
    pub limits: QuotaLimits,
    /// Minimum time between placements on one event. Zero disables the
    /// gate.
    pub min_interval: chrono::Duration,
    /// Unilateral batches only bet on odds flagged latest.
    pub unilateral: bool,
}

impl ExecutionSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            preview: cfg.engine.preview_policy(),
            placement: cfg.engine.placement_policy(),
            limits: QuotaLimits::from(&cfg.limits),
            min_interval: cfg.engine.min_interval(),
            unilateral: cfg.engine.unilateral,
        }
    }
}

/// Why one placement attempt did not produce a bet.
#[derive(Debug)]
enum PlaceFailure {
    Transport(AdapterError),
    Rejected(String),
}

impl fmt::Display for PlaceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaceFailure::Transport(e) => write!(f, "{e}"),
            PlaceFailure::Rejected(msg) => write!(f, "{msg}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct LegExecutor {
    registry: Arc<AdapterRegistry>,
    accounts: Arc<AccountPool>,
    ledger: Arc<QuotaLedger>,
    settings: ExecutionSettings,
}

impl LegExecutor {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        accounts: Arc<AccountPool>,
        ledger: Arc<QuotaLedger>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            registry,
            accounts,
            ledger,
            settings,
        }
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    /// Run one leg for `user_id`. Never fails: every problem ends up in the
    /// returned outcome.
    pub async fn execute(&self, user_id: &str, offer: &LegOffer) -> LegResult {
        let site = offer.site_id.as_str();

        if self.settings.unilateral && !offer.is_latest {
            info!(site, event = %offer.event_id, "Odds not flagged latest, skipping leg");
            return LegResult::without_account(site, LegOutcome::Skipped(SkipReason::NotLatestOdds));
        }

        let adapter = match self.registry.resolve(site) {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!(site, error = %e, "Leg has no adapter");
                return LegResult::without_account(site, LegOutcome::Skipped(SkipReason::NoAdapter));
            }
        };

        let mut account = match self
            .accounts
            .next_matching(user_id, site, AccountCredential::is_placeable)
            .await
        {
            Ok(Some(account)) => account,
            Ok(None) => {
                info!(site, user = %user_id, "No usable account");
                return LegResult::without_account(site, LegOutcome::Skipped(SkipReason::NoAccount));
            }
            Err(e) => {
                warn!(site, user = %user_id, error = %e, "Account store unavailable");
                return LegResult::without_account(site, LegOutcome::Skipped(SkipReason::NoAccount));
            }
        };

        let outcome = self.run(user_id, offer, adapter, &mut account).await;
        LegResult::with_account(&account, outcome)
    }

    async fn run(
        &self,
        user_id: &str,
        offer: &LegOffer,
        adapter: Arc<dyn SiteAdapter>,
        account: &mut AccountCredential,
    ) -> LegOutcome {
        if !account.token_valid {
            if let Err(outcome) = self.login(user_id, adapter.as_ref(), account).await {
                return outcome;
            }
        }

        // Preview: only a missing answer retries.
        let acct: &AccountCredential = account;
        let quote = retry_until_some(&self.settings.preview, "preview", |attempt| {
            let adapter = adapter.clone();
            async move {
                match adapter.preview(acct, offer).await {
                    Ok(quote) => quote,
                    Err(e) => {
                        debug!(account = %acct.account_name, attempt, error = %e, "Preview transport error");
                        None
                    }
                }
            }
        })
        .await;

        let quote = match quote {
            Some(quote) if quote.success => quote,
            Some(quote) => {
                info!(account = %acct.account_name, reason = %quote.message, "Preview rejected");
                return LegOutcome::Rejected {
                    stage: Stage::Preparation,
                    reason: quote.message,
                };
            }
            None => {
                return LegOutcome::TransportFailed {
                    stage: Stage::Preparation,
                    reason: format!("no preview after {} attempts", self.settings.preview.max_attempts),
                };
            }
        };

        let stake = match size_stake(acct, offer.stake, &quote) {
            Ok(stake) => stake,
            Err(reason) => {
                info!(account = %acct.account_name, reason = %reason, "Stake outside site limits");
                return LegOutcome::Rejected {
                    stage: Stage::Preparation,
                    reason,
                };
            }
        };

        let key = quota_key(user_id, &offer.event_id);
        if !self.ledger.reserve(&key, &offer.score, &self.settings.limits).await {
            return LegOutcome::Skipped(SkipReason::QuotaExhausted);
        }

        let placer = match self.registry.placement_adapter(acct) {
            Ok(placer) => placer,
            Err(e) => {
                warn!(site = %offer.site_id, error = %e, "No placement adapter");
                self.ledger.rollback(&key, &offer.score).await;
                return LegOutcome::Skipped(SkipReason::NoAdapter);
            }
        };

        let mut sized = offer.clone();
        sized.stake = stake;
        let leg = &sized;
        let quote_ref = &quote;
        let placed = retry_until_done(&self.settings.placement, "place", move |attempt| {
            let placer = placer.clone();
            async move {
                match placer.place(acct, leg, quote_ref).await {
                    Ok(result) => match result.confirmed_id() {
                        Some(bet_id) => Attempt::Done(Placement {
                            bet_id: bet_id.to_string(),
                            info: result
                                .info
                                .clone()
                                .unwrap_or_else(|| BetInfo::from_offer(leg, quote_ref.odds, leg.stake)),
                            placed_at: Utc::now(),
                        }),
                        None => {
                            debug!(account = %acct.account_name, attempt, reason = %result.message, "Placement not confirmed");
                            Attempt::Retry(PlaceFailure::Rejected(result.message))
                        }
                    },
                    Err(e) => Attempt::Retry(PlaceFailure::Transport(e)),
                }
            }
        })
        .await;

        match placed {
            Ok(placement) => {
                info!(
                    account = %acct.account_name,
                    site = %offer.site_id,
                    bet_id = %placement.bet_id,
                    stake = %stake,
                    odds = %quote.odds,
                    "Leg placed"
                );
                let balance = self.refresh_balance(&adapter, acct).await;
                let update = AccountUpdate {
                    balance,
                    message: Some(format!("placed {}", placement.bet_id)),
                    ..Default::default()
                };
                self.write_back(user_id, account, update).await;
                LegOutcome::Placed(placement)
            }
            Err(exhausted) => {
                warn!(
                    account = %acct.account_name,
                    site = %offer.site_id,
                    attempts = exhausted.attempts,
                    error = %exhausted.last,
                    "Placement failed, releasing quota"
                );
                self.ledger.rollback(&key, &offer.score).await;
                let reason = exhausted.last.to_string();
                self.write_back(user_id, account, AccountUpdate::message(reason.clone())).await;
                match exhausted.last {
                    PlaceFailure::Transport(_) => LegOutcome::TransportFailed {
                        stage: Stage::Placement,
                        reason,
                    },
                    PlaceFailure::Rejected(_) => LegOutcome::Rejected {
                        stage: Stage::Placement,
                        reason,
                    },
                }
            }
        }
    }

    /// Log in an account whose session is gone. The new session state is
    /// written back either way.
    async fn login(
        &self,
        user_id: &str,
        adapter: &dyn SiteAdapter,
        account: &mut AccountCredential,
    ) -> Result<(), LegOutcome> {
        debug!(account = %account.account_name, "Session invalid, logging in");
        match adapter.login(account, &LoginParams::new()).await {
            Ok(login) if login.success => {
                let update = AccountUpdate {
                    token_valid: Some(true),
                    token: login.token,
                    message: Some(login.message),
                    ..Default::default()
                };
                self.write_back(user_id, account, update).await;
                info!(account = %account.account_name, "Auto-login succeeded");
                Ok(())
            }
            Ok(login) => {
                warn!(account = %account.account_name, reason = %login.message, "Auto-login rejected");
                let update = AccountUpdate {
                    token_valid: Some(false),
                    message: Some(login.message.clone()),
                    ..Default::default()
                };
                self.write_back(user_id, account, update).await;
                Err(LegOutcome::Rejected {
                    stage: Stage::Preparation,
                    reason: format!("login failed: {}", login.message),
                })
            }
            Err(e) => {
                warn!(account = %account.account_name, error = %e, "Auto-login transport error");
                Err(LegOutcome::TransportFailed {
                    stage: Stage::Preparation,
                    reason: format!("login: {e}"),
                })
            }
        }
    }

    async fn refresh_balance(&self, adapter: &Arc<dyn SiteAdapter>, account: &AccountCredential) -> Option<Decimal> {
        let adapter = if account.simulate {
            self.registry.placement_adapter(account).ok()?
        } else {
            adapter.clone()
        };
        match adapter.balance(account).await {
            Ok(b) if b.success => b.balance,
            Ok(b) => {
                debug!(account = %account.account_name, reason = %b.message, "Balance not available");
                None
            }
            Err(e) => {
                debug!(account = %account.account_name, error = %e, "Balance refresh failed");
                None
            }
        }
    }

    /// Apply `update` locally and persist it. Store failures are logged.
    async fn write_back(&self, user_id: &str, account: &mut AccountCredential, update: AccountUpdate) {
        account.apply(&update);
        if let Err(e) = self
            .accounts
            .store()
            .update_account(user_id, &account.site_id, &account.account_id, &update)
            .await
        {
            warn!(account = %account.account_name, error = %e, "Failed to write back account state");
        }
    }
}

/// Account stake capped by the quote's maximum. Fails when the result is
/// not positive or falls under the quote's minimum.
fn size_stake(account: &AccountCredential, base: Decimal, quote: &PreviewResult) -> Result<Decimal, String> {
    let mut stake = account.scaled_stake(base);
    if let Some(max) = quote.max_stake {
        if stake > max {
            debug!(account = %account.account_name, stake = %stake, max = %max, "Stake capped at site maximum");
            stake = max;
        }
    }
    if stake <= Decimal::ZERO {
        return Err(format!("stake {stake} is not positive"));
    }
    if let Some(min) = quote.min_stake {
        if stake < min {
            return Err(format!("stake {stake} below site minimum {min}"));
        }
    }
    Ok(stake)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
