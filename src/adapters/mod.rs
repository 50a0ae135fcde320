//! Bookmaker protocol adapters.
//!
//! Defines the `SiteAdapter` trait and the registry that maps a site id to
//! its adapter. Implementations:
//! - `simulated`: in-process bookmaker for simulate-only accounts and dry runs
//! - `gateway`: JSON-over-HTTPS client for a bookmaker gateway
//!
//! Adapters never return `Err` for a business rejection (bad session,
//! insufficient funds, odds moved). Those come back as `success = false`
//! with a message. `Err(AdapterError)` is reserved for transport failures.

pub mod gateway;
pub mod simulated;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{AdapterKind, AppConfig, SiteConfig};
use crate::types::{
    AccountCredential, AdapterError, BalanceResult, EngineError, ExternalBetRecord, LegOffer,
    LoginParams, LoginResult, PlacementResult, PreviewResult,
};

use self::gateway::GatewayAdapter;
use self::simulated::SimulatedAdapter;

/// One bookmaker's wire protocol, behind a normalized interface.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SiteAdapter: Send + Sync {
    /// Establish a session for the account.
    async fn login(&self, credential: &AccountCredential, params: &LoginParams) -> Result<LoginResult, AdapterError>;

    /// Quote the offer. `Ok(None)` means the site gave no usable answer.
    async fn preview(&self, credential: &AccountCredential, offer: &LegOffer) -> Result<Option<PreviewResult>, AdapterError>;

    /// Place the offer using a quote from `preview`. `offer.stake` is the
    /// final stake.
    async fn place(
        &self,
        credential: &AccountCredential,
        offer: &LegOffer,
        preview: &PreviewResult,
    ) -> Result<PlacementResult, AdapterError>;

    async fn balance(&self, credential: &AccountCredential) -> Result<BalanceResult, AdapterError>;

    /// Bets on the account the site has not settled yet.
    async fn unsettled(&self, credential: &AccountCredential) -> Result<Vec<ExternalBetRecord>, AdapterError>;
}

/// Site id → adapter, resolved once per leg.
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn SiteAdapter>>,
    simulated: Arc<dyn SiteAdapter>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
            simulated: Arc::new(SimulatedAdapter::default()),
        }
    }

    /// Build the registry described by `[[sites]]`.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        let mut registry = Self::new();
        for site in &cfg.sites {
            let adapter = build_adapter(site, &registry.simulated)?;
            registry.register(&site.id, adapter);
        }
        Ok(registry)
    }

    pub fn register(&mut self, site_id: &str, adapter: Arc<dyn SiteAdapter>) {
        self.adapters.insert(site_id.to_string(), adapter);
    }

    /// Replace the adapter that serves simulate-only accounts.
    pub fn with_simulated(mut self, adapter: Arc<dyn SiteAdapter>) -> Self {
        self.simulated = adapter;
        self
    }

    pub fn resolve(&self, site_id: &str) -> Result<Arc<dyn SiteAdapter>, EngineError> {
        self.adapters
            .get(site_id)
            .cloned()
            .ok_or_else(|| EngineError::AdapterNotFound(site_id.to_string()))
    }

    /// The adapter that places bets for `credential`: the simulated one for
    /// simulate-only accounts, the site's own otherwise.
    pub fn placement_adapter(&self, credential: &AccountCredential) -> Result<Arc<dyn SiteAdapter>, EngineError> {
        if credential.simulate {
            return Ok(self.simulated.clone());
        }
        self.resolve(&credential.site_id)
    }

    pub fn sites(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn build_adapter(site: &SiteConfig, simulated: &Arc<dyn SiteAdapter>) -> Result<Arc<dyn SiteAdapter>> {
    match site.adapter {
        AdapterKind::Simulated => {
            info!(site = %site.id, "Using simulated adapter");
            Ok(simulated.clone())
        }
        AdapterKind::Gateway => {
            let base_url = site.base_url.clone().ok_or_else(|| {
                EngineError::Config(format!("site {} uses the gateway adapter but has no base_url", site.id))
            })?;
            let api_key = match &site.api_key_env {
                Some(env) => Some(AppConfig::resolve_env(env)?),
                None => None,
            };
            info!(site = %site.id, base_url = %base_url, "Using gateway adapter");
            Ok(Arc::new(GatewayAdapter::new(
                &site.id,
                &base_url,
                api_key,
                Duration::from_secs(site.timeout_secs),
            )?))
        }
    }
}
