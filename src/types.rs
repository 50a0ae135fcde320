//! Shared types for the HEDGE engine.
//!
//! These types form the data model used across all modules. Adapters,
//! stores and the engine depend on them without depending on each other.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

/// Which side of a two-leg hedge a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LegSide {
    A,
    B,
}

impl LegSide {
    pub fn other(&self) -> Self {
        match self {
            LegSide::A => LegSide::B,
            LegSide::B => LegSide::A,
        }
    }
}

impl fmt::Display for LegSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegSide::A => write!(f, "A"),
            LegSide::B => write!(f, "B"),
        }
    }
}

/// One side of an opportunity, as captured by the scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegOffer {
    pub site_id: String,
    pub event_id: String,
    /// Site-specific market/odds identifier.
    pub market_id: String,
    /// Site-specific selection identifier.
    pub selection_id: String,
    /// Decimal odds at capture time.
    pub odds: Decimal,
    /// Score at capture, e.g. "2-1". Quota counters are keyed by it.
    pub score: String,
    /// Whether these odds were confirmed to be the most current.
    #[serde(default)]
    pub is_latest: bool,
    /// Base stake before the account multiplier is applied.
    pub stake: Decimal,
    #[serde(default)]
    pub league: String,
    #[serde(default)]
    pub home_team: String,
    #[serde(default)]
    pub away_team: String,
    #[serde(default)]
    pub market_name: String,
}

impl fmt::Display for LegOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} @ {} stake={} score={}",
            self.site_id, self.event_id, self.selection_id, self.odds, self.stake, self.score,
        )
    }
}

/// A two-leg opportunity handed to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetCandidate {
    /// Stable id, reused as the persisted record id.
    pub id: String,
    pub user_id: String,
    pub leg_a: LegOffer,
    pub leg_b: LegOffer,
}

impl BetCandidate {
    pub fn leg(&self, side: LegSide) -> &LegOffer {
        match side {
            LegSide::A => &self.leg_a,
            LegSide::B => &self.leg_b,
        }
    }
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// A bookmaker account as held by the configuration store.
#[derive(Clone, Serialize, Deserialize)]
pub struct AccountCredential {
    pub site_id: String,
    pub account_id: String,
    pub account_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_login: bool,
    #[serde(default)]
    pub token_valid: bool,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_multiplier")]
    pub stake_multiplier: Decimal,
    /// Place bets against the simulated adapter instead of the real site.
    #[serde(default)]
    pub simulate: bool,
    #[serde(default)]
    pub last_balance: Option<Decimal>,
    #[serde(default)]
    pub last_message: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_multiplier() -> Decimal {
    Decimal::ONE
}

// Tokens never reach the logs.
impl fmt::Debug for AccountCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountCredential")
            .field("site_id", &self.site_id)
            .field("account_id", &self.account_id)
            .field("account_name", &self.account_name)
            .field("enabled", &self.enabled)
            .field("auto_login", &self.auto_login)
            .field("token_valid", &self.token_valid)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("stake_multiplier", &self.stake_multiplier)
            .field("simulate", &self.simulate)
            .finish()
    }
}

impl AccountCredential {
    /// Whether the account can be used for placement, possibly after a login.
    pub fn is_placeable(&self) -> bool {
        self.enabled && (self.token_valid || self.auto_login)
    }

    /// Stake for this account: base stake times multiplier, to the cent.
    pub fn scaled_stake(&self, base: Decimal) -> Decimal {
        (base * self.stake_multiplier).round_dp(2)
    }

    /// Apply execution-observed fields.
    pub fn apply(&mut self, update: &AccountUpdate) {
        if let Some(valid) = update.token_valid {
            self.token_valid = valid;
        }
        if let Some(token) = &update.token {
            self.token = Some(token.clone());
        }
        if let Some(balance) = update.balance {
            self.last_balance = Some(balance);
        }
        if let Some(message) = &update.message {
            self.last_message = Some(message.clone());
        }
    }
}

/// Fields the engine writes back to the account store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountUpdate {
    pub token_valid: Option<bool>,
    pub token: Option<String>,
    pub balance: Option<Decimal>,
    pub message: Option<String>,
}

impl AccountUpdate {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Adapter results
// ---------------------------------------------------------------------------

/// Extra login inputs some sites need (captcha answers, device ids, ...).
pub type LoginParams = BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResult {
    pub success: bool,
    pub token: Option<String>,
    pub message: String,
}

/// A bet slip quote returned by the site before placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewResult {
    pub success: bool,
    /// Odds currently offered for the selection.
    pub odds: Decimal,
    #[serde(default)]
    pub min_stake: Option<Decimal>,
    #[serde(default)]
    pub max_stake: Option<Decimal>,
    /// Opaque site ticket passed back to `place`.
    #[serde(default)]
    pub ticket: serde_json::Value,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementResult {
    pub success: bool,
    pub bet_id: Option<String>,
    pub info: Option<BetInfo>,
    pub message: String,
}

impl PlacementResult {
    /// The external bet id, if the site confirmed the bet with one.
    pub fn confirmed_id(&self) -> Option<&str> {
        if !self.success {
            return None;
        }
        self.bet_id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceResult {
    pub success: bool,
    pub balance: Option<Decimal>,
    pub message: String,
}

/// Normalized bet description recorded with each placed leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetInfo {
    pub league: String,
    pub home_team: String,
    pub away_team: String,
    pub market: String,
    pub selection: String,
    pub odds: Decimal,
    pub amount: Decimal,
}

impl BetInfo {
    /// Bet info derived from the offer itself, used when a site does not
    /// echo one back.
    pub fn from_offer(offer: &LegOffer, odds: Decimal, amount: Decimal) -> Self {
        Self {
            league: offer.league.clone(),
            home_team: offer.home_team.clone(),
            away_team: offer.away_team.clone(),
            market: offer.market_name.clone(),
            selection: offer.selection_id.clone(),
            odds,
            amount,
        }
    }
}

impl fmt::Display for BetInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} v {} [{} {}] {} @ {}",
            self.league, self.home_team, self.away_team, self.market, self.selection, self.amount,
            self.odds,
        )
    }
}

/// A bet as reported by a site's unsettled-bets listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalBetRecord {
    pub bet_id: String,
    pub status: String,
    #[serde(default)]
    pub stake: Option<Decimal>,
    #[serde(default)]
    pub odds: Option<Decimal>,
    #[serde(default)]
    pub payout: Option<Decimal>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Leg outcomes
// ---------------------------------------------------------------------------

/// Why a leg never reached the placement call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Unilateral batch and odds not flagged latest.
    NotLatestOdds,
    /// Last placement on the event is too recent.
    IntervalNotElapsed,
    QuotaExhausted,
    NoAccount,
    NoAdapter,
    /// The partner leg fired first and did not succeed.
    PartnerNotPlaced,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotLatestOdds => write!(f, "odds not latest"),
            SkipReason::IntervalNotElapsed => write!(f, "minimum interval not elapsed"),
            SkipReason::QuotaExhausted => write!(f, "quota exhausted"),
            SkipReason::NoAccount => write!(f, "no usable account"),
            SkipReason::NoAdapter => write!(f, "no adapter for site"),
            SkipReason::PartnerNotPlaced => write!(f, "not attempted"),
        }
    }
}

/// A confirmed bet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Placement {
    pub bet_id: String,
    pub info: BetInfo,
    pub placed_at: DateTime<Utc>,
}

/// Where a failed leg stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Login, preview or stake sizing. No placement call was made.
    Preparation,
    Placement,
}

/// Tagged result of driving one leg.
#[derive(Debug, Clone)]
pub enum LegOutcome {
    Skipped(SkipReason),
    TransportFailed { stage: Stage, reason: String },
    Rejected { stage: Stage, reason: String },
    Placed(Placement),
}

impl LegOutcome {
    pub fn is_placed(&self) -> bool {
        matches!(self, LegOutcome::Placed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, LegOutcome::Skipped(_))
    }

    /// Whether the placement call was made for this leg.
    pub fn attempted(&self) -> bool {
        match self {
            LegOutcome::Placed(_) => true,
            LegOutcome::TransportFailed { stage, .. } | LegOutcome::Rejected { stage, .. } => {
                *stage == Stage::Placement
            }
            LegOutcome::Skipped(_) => false,
        }
    }
}

impl fmt::Display for LegOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegOutcome::Skipped(reason) => write!(f, "skipped: {reason}"),
            LegOutcome::TransportFailed { reason, .. } => write!(f, "transport failed: {reason}"),
            LegOutcome::Rejected { reason, .. } => write!(f, "rejected: {reason}"),
            LegOutcome::Placed(p) => write!(f, "placed: {}", p.bet_id),
        }
    }
}

/// Outcome of one leg plus the account it ran on.
#[derive(Debug, Clone)]
pub struct LegResult {
    pub site_id: String,
    pub account_id: Option<String>,
    pub account_name: Option<String>,
    pub outcome: LegOutcome,
}

impl LegResult {
    pub fn without_account(site_id: &str, outcome: LegOutcome) -> Self {
        Self {
            site_id: site_id.to_string(),
            account_id: None,
            account_name: None,
            outcome,
        }
    }

    pub fn with_account(account: &AccountCredential, outcome: LegOutcome) -> Self {
        Self {
            site_id: account.site_id.clone(),
            account_id: Some(account.account_id.clone()),
            account_name: Some(account.account_name.clone()),
            outcome,
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// One leg as persisted in bet history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegRecord {
    pub site_id: String,
    pub success: bool,
    pub bet_id: Option<String>,
    pub account_id: Option<String>,
    pub account_name: Option<String>,
    pub bet_info: Option<BetInfo>,
    pub bet_time: Option<DateTime<Utc>>,
    pub message: String,
    /// Settlement detail merged in by reconciliation.
    #[serde(default)]
    pub detail: Option<ExternalBetRecord>,
}

impl From<&LegResult> for LegRecord {
    fn from(result: &LegResult) -> Self {
        let (bet_id, bet_info, bet_time) = match &result.outcome {
            LegOutcome::Placed(p) => (Some(p.bet_id.clone()), Some(p.info.clone()), Some(p.placed_at)),
            _ => (None, None, None),
        };
        Self {
            site_id: result.site_id.clone(),
            success: result.outcome.is_placed(),
            bet_id,
            account_id: result.account_id.clone(),
            account_name: result.account_name.clone(),
            bet_info,
            bet_time,
            message: result.outcome.to_string(),
            detail: None,
        }
    }
}

impl LegRecord {
    /// Placed but not yet matched against a settlement listing.
    pub fn awaiting_detail(&self) -> bool {
        self.success && self.detail.is_none() && self.bet_id.is_some() && self.account_id.is_some()
    }
}

/// The merged record of a two-leg bet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwoLegBetRecord {
    pub id: String,
    pub user_id: String,
    /// History partition date.
    pub date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub leg_a: LegRecord,
    pub leg_b: LegRecord,
}

impl TwoLegBetRecord {
    pub fn new(candidate: &BetCandidate, leg_a: &LegResult, leg_b: &LegResult) -> Self {
        let now = Utc::now();
        Self {
            id: candidate.id.clone(),
            user_id: candidate.user_id.clone(),
            date: now.date_naive(),
            created_at: now,
            leg_a: leg_a.into(),
            leg_b: leg_b.into(),
        }
    }

    pub fn leg(&self, side: LegSide) -> &LegRecord {
        match side {
            LegSide::A => &self.leg_a,
            LegSide::B => &self.leg_b,
        }
    }

    pub fn leg_mut(&mut self, side: LegSide) -> &mut LegRecord {
        match side {
            LegSide::A => &mut self.leg_a,
            LegSide::B => &mut self.leg_b,
        }
    }
}

impl fmt::Display for TwoLegBetRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let leg = |l: &LegRecord| {
            format!(
                "{}:{}",
                l.site_id,
                if l.success { l.bet_id.as_deref().unwrap_or("?") } else { "-" }
            )
        };
        write!(f, "[{}] {} A={} B={}", self.date, self.id, leg(&self.leg_a), leg(&self.leg_b))
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Transport-level failure talking to a site. Business rejections are not
/// errors; adapters report them as `success = false`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("transport error: {0}")]
    Other(String),
}

/// Failure in one of the collaborator stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Domain-specific error types for the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("No adapter registered for site: {0}")]
    AdapterNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Adapter error ({site}): {source}")]
    Adapter {
        site: String,
        #[source]
        source: AdapterError,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
