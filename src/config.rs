//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Every engine tunable has a default so a minimal file only lists sites.
//! Secrets (gateway API keys) are referenced by env-var name in the config
//! and resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use crate::quota::QuotaLimits;
use crate::retry::RetryPolicy;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub preview_attempts: u32,
    pub preview_delay_ms: u64,
    pub placement_attempts: u32,
    pub placement_delay_ms: u64,
    /// Attempts for plain transport failures against the quota store.
    pub transport_attempts: u32,
    pub transport_delay_ms: u64,
    /// Minimum spacing between odds-endpoint calls on one account.
    pub cooldown_ms: u64,
    pub lock_wait_ms: u64,
    pub lock_lease_ms: u64,
    pub quota_ttl_hours: u64,
    /// Hard ceiling on waiting for a batch to finish.
    pub batch_timeout_secs: u64,
    pub pool_cap: usize,
    pub pool_backlog: usize,
    /// Minimum seconds between successful placements on the same event.
    pub min_interval_secs: u64,
    /// Only place legs whose odds are flagged as latest.
    pub unilateral: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            preview_attempts: 10,
            preview_delay_ms: 200,
            placement_attempts: 10,
            placement_delay_ms: 0,
            transport_attempts: 10,
            transport_delay_ms: 300,
            cooldown_ms: 2_000,
            lock_wait_ms: 2_000,
            lock_lease_ms: 5_000,
            quota_ttl_hours: 24,
            batch_timeout_secs: 60,
            pool_cap: 100,
            pool_backlog: 1_000,
            min_interval_secs: 0,
            unilateral: false,
        }
    }
}

impl EngineConfig {
    pub fn preview_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.preview_attempts, Duration::from_millis(self.preview_delay_ms))
    }

    pub fn placement_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.placement_attempts, Duration::from_millis(self.placement_delay_ms))
    }

    pub fn transport_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.transport_attempts, Duration::from_millis(self.transport_delay_ms))
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    pub fn quota_ttl(&self) -> Duration {
        Duration::from_secs(self.quota_ttl_hours * 3_600)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }

    pub fn min_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.min_interval_secs as i64)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LimitsConfig {
    pub per_score: u32,
    pub per_event: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            per_score: 1,
            per_event: 3,
        }
    }
}

impl From<&LimitsConfig> for QuotaLimits {
    fn from(cfg: &LimitsConfig) -> Self {
        QuotaLimits {
            per_score: cfg.per_score,
            per_event: cfg.per_event,
        }
    }
}

/// Which adapter implementation serves a site.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Simulated,
    Gateway,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SiteConfig {
    pub id: String,
    /// Rolling order: lower fires first; equal values fire together.
    #[serde(default)]
    pub priority: u32,
    pub adapter: AdapterKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

fn default_http_timeout() -> u64 {
    15
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub history_dir: String,
    pub accounts_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            history_dir: "hedge_history".to_string(),
            accounts_file: "accounts.json".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse configuration from TOML text.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Rolling-order priority per site id.
    pub fn priorities(&self) -> HashMap<String, u32> {
        self.sites.iter().map(|s| (s.id.clone(), s.priority)).collect()
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
