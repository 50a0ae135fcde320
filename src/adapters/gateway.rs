//! Bookmaker gateway client.
//!
//! Speaks a normalized JSON protocol to a per-site gateway service that
//! hides the bookmaker's own wire format. Every response is an envelope:
//!
//! ```json
//! { "success": true, "message": "ok", "data": { ... } }
//! ```
//!
//! Endpoints (relative to the site's `base_url`):
//! - `POST /login`, `POST /preview`, `POST /place`
//! - `GET /balance`, `GET /unsettled`
//!
//! Auth: `X-Api-Key` (gateway key, optional), `X-Account-Id`, and
//! `Authorization: Bearer {session token}` once logged in.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::SiteAdapter;
use crate::types::{
    AccountCredential, AdapterError, BalanceResult, BetInfo, ExternalBetRecord, LegOffer, LoginParams,
    LoginResult, PlacementResult, PreviewResult,
};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    account_id: &'a str,
    account_name: &'a str,
    params: &'a LoginParams,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct OfferRequest<'a> {
    event_id: &'a str,
    market_id: &'a str,
    selection_id: &'a str,
    odds: Decimal,
    stake: Decimal,
}

impl<'a> From<&'a LegOffer> for OfferRequest<'a> {
    fn from(offer: &'a LegOffer) -> Self {
        Self {
            event_id: &offer.event_id,
            market_id: &offer.market_id,
            selection_id: &offer.selection_id,
            odds: offer.odds,
            stake: offer.stake,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PreviewData {
    odds: Decimal,
    #[serde(default)]
    min_stake: Option<Decimal>,
    #[serde(default)]
    max_stake: Option<Decimal>,
    #[serde(default)]
    ticket: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct PlaceRequest<'a> {
    #[serde(flatten)]
    offer: OfferRequest<'a>,
    ticket: &'a serde_json::Value,
    quoted_odds: Decimal,
}

#[derive(Debug, Deserialize)]
struct PlaceData {
    #[serde(default)]
    bet_id: Option<String>,
    #[serde(default)]
    info: Option<BetInfo>,
}

#[derive(Debug, Deserialize)]
struct BalanceData {
    balance: Decimal,
}

#[derive(Debug, Deserialize)]
struct UnsettledData {
    #[serde(default)]
    bets: Vec<ExternalBetRecord>,
}

// ---------------------------------------------------------------------------
// Response mapping
// ---------------------------------------------------------------------------

fn decode<T: DeserializeOwned>(body: &str) -> Result<Envelope<T>, AdapterError> {
    serde_json::from_str(body).map_err(|e| AdapterError::Malformed(format!("{e}: {}", truncate(body))))
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

fn parse_login(body: &str) -> Result<LoginResult, AdapterError> {
    let env: Envelope<LoginData> = decode(body)?;
    let token = env.data.and_then(|d| d.token);
    Ok(LoginResult {
        success: env.success && token.is_some(),
        token,
        message: env.message,
    })
}

fn parse_preview(body: &str) -> Result<Option<PreviewResult>, AdapterError> {
    let env: Envelope<PreviewData> = decode(body)?;
    match env.data {
        Some(data) => Ok(Some(PreviewResult {
            success: env.success,
            odds: data.odds,
            min_stake: data.min_stake,
            max_stake: data.max_stake,
            ticket: data.ticket,
            message: env.message,
        })),
        // A rejection needs no quote; a "success" without one is no answer.
        None if !env.success => Ok(Some(PreviewResult {
            success: false,
            odds: Decimal::ZERO,
            min_stake: None,
            max_stake: None,
            ticket: serde_json::Value::Null,
            message: env.message,
        })),
        None => Ok(None),
    }
}

fn parse_place(body: &str) -> Result<PlacementResult, AdapterError> {
    let env: Envelope<PlaceData> = decode(body)?;
    let (bet_id, info) = env.data.map(|d| (d.bet_id, d.info)).unwrap_or((None, None));
    Ok(PlacementResult {
        success: env.success,
        bet_id,
        info,
        message: env.message,
    })
}

fn parse_balance(body: &str) -> Result<BalanceResult, AdapterError> {
    let env: Envelope<BalanceData> = decode(body)?;
    Ok(BalanceResult {
        success: env.success,
        balance: env.data.map(|d| d.balance),
        message: env.message,
    })
}

fn parse_unsettled(body: &str) -> Result<Vec<ExternalBetRecord>, AdapterError> {
    let env: Envelope<UnsettledData> = decode(body)?;
    if !env.success {
        return Err(AdapterError::Malformed(format!("unsettled listing refused: {}", env.message)));
    }
    Ok(env.data.map(|d| d.bets).unwrap_or_default())
}

fn map_reqwest(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Timeout(err.to_string())
    } else if err.is_connect() {
        AdapterError::Connect(err.to_string())
    } else if err.is_decode() {
        AdapterError::Malformed(err.to_string())
    } else {
        AdapterError::Other(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Gateway client for one site.
pub struct GatewayAdapter {
    http: Client,
    site_id: String,
    base_url: String,
    api_key: Option<String>,
}

impl GatewayAdapter {
    pub fn new(site_id: &str, base_url: &str, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("HEDGE/0.1.0 (bet-execution-engine)")
            .build()
            .with_context(|| format!("Failed to build HTTP client for {site_id}"))?;

        Ok(Self {
            http,
            site_id: site_id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authed(&self, req: RequestBuilder, credential: &AccountCredential) -> RequestBuilder {
        let mut req = req
            .header("Accept", "application/json")
            .header("X-Account-Id", &credential.account_id);
        if let Some(key) = &self.api_key {
            req = req.header("X-Api-Key", key);
        }
        if let Some(token) = &credential.token {
            req = req.bearer_auth(token);
        }
        req
    }

    /// Send and return the body of a 2xx response.
    async fn send(&self, op: &str, req: RequestBuilder) -> Result<String, AdapterError> {
        let resp = req.send().await.map_err(map_reqwest)?;
        let status = resp.status();
        let body = resp.text().await.map_err(map_reqwest)?;
        debug!(site = %self.site_id, op, status = status.as_u16(), "Gateway response");

        if !status.is_success() {
            return Err(AdapterError::Status {
                status: status.as_u16(),
                body: truncate(&body).to_string(),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl SiteAdapter for GatewayAdapter {
    async fn login(&self, credential: &AccountCredential, params: &LoginParams) -> Result<LoginResult, AdapterError> {
        let body = LoginRequest {
            account_id: &credential.account_id,
            account_name: &credential.account_name,
            params,
        };
        let req = self.authed(self.http.post(self.url("login")), credential).json(&body);
        parse_login(&self.send("login", req).await?)
    }

    async fn preview(&self, credential: &AccountCredential, offer: &LegOffer) -> Result<Option<PreviewResult>, AdapterError> {
        let req = self
            .authed(self.http.post(self.url("preview")), credential)
            .json(&OfferRequest::from(offer));
        parse_preview(&self.send("preview", req).await?)
    }

    async fn place(
        &self,
        credential: &AccountCredential,
        offer: &LegOffer,
        preview: &PreviewResult,
    ) -> Result<PlacementResult, AdapterError> {
        let body = PlaceRequest {
            offer: OfferRequest::from(offer),
            ticket: &preview.ticket,
            quoted_odds: preview.odds,
        };
        let req = self.authed(self.http.post(self.url("place")), credential).json(&body);
        parse_place(&self.send("place", req).await?)
    }

    async fn balance(&self, credential: &AccountCredential) -> Result<BalanceResult, AdapterError> {
        let req = self.authed(self.http.get(self.url("balance")), credential);
        parse_balance(&self.send("balance", req).await?)
    }

    async fn unsettled(&self, credential: &AccountCredential) -> Result<Vec<ExternalBetRecord>, AdapterError> {
        let req = self.authed(self.http.get(self.url("unsettled")), credential);
        parse_unsettled(&self.send("unsettled", req).await?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
