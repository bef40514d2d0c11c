//! Configuration management for the transaction manager
//!
//! Loads configuration from TOML files with environment variable substitution.
//! Each pipeline component receives only the narrow section it reads.

use anyhow::{Context, Result};
use ethers::types::{Address, U256};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub wallet: WalletConfig,
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub backend: StorageBackend,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_query_timeout_ms")]
    pub default_query_timeout_ms: u64,
    #[serde(default)]
    pub log_sql: bool,
}

impl DatabaseConfig {
    pub fn default_query_timeout(&self) -> Duration {
        Duration::from_millis(self.default_query_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Environment variable holding comma separated hex private keys
    pub private_keys_env: String,
}

/// Chain class
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    #[default]
    Evm,
    Arbitrum,
    Optimism,
    Base,
    Zksync,
    Scroll,
    Polygon,
}

impl ChainType {
    /// Rollups settle on L1; their heads advance far faster than L1 finality
    pub fn is_l2(&self) -> bool {
        matches!(
            self,
            ChainType::Arbitrum
                | ChainType::Optimism
                | ChainType::Base
                | ChainType::Zksync
                | ChainType::Scroll
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainType::Evm => "evm",
            ChainType::Arbitrum => "arbitrum",
            ChainType::Optimism => "optimism",
            ChainType::Base => "base",
            ChainType::Zksync => "zksync",
            ChainType::Scroll => "scroll",
            ChainType::Polygon => "polygon",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub enabled: bool,
    #[serde(default)]
    pub chain_type: ChainType,
    pub finality_depth: Option<u32>,
    #[serde(default)]
    pub finality_tag_enabled: bool,
    #[serde(default = "default_true")]
    pub nonce_auto_sync: bool,
    #[serde(default = "default_rpc_batch_size")]
    pub rpc_batch_size: u32,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_broadcast_interval_ms")]
    pub broadcast_interval_ms: u64,
    pub fees: FeeConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
}

impl ChainConfig {
    /// Chain policy view consumed by the broadcaster and confirmer
    pub fn policy(&self) -> ChainPolicy {
        ChainPolicy {
            chain_id: self.chain_id,
            finality_depth: self.finality_depth.unwrap_or_else(|| {
                crate::chain::finality::recommended_finality_depth(self.chain_id)
            }),
            finality_tag_enabled: self.finality_tag_enabled,
            nonce_auto_sync: self.nonce_auto_sync,
            rpc_batch_size: self.rpc_batch_size.max(1) as usize,
            broadcast_interval: Duration::from_millis(self.broadcast_interval_ms),
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Resolved chain policy
#[derive(Debug, Clone)]
pub struct ChainPolicy {
    pub chain_id: u64,
    pub finality_depth: u32,
    pub finality_tag_enabled: bool,
    pub nonce_auto_sync: bool,
    pub rpc_batch_size: usize,
    pub broadcast_interval: Duration,
}

/// Fee bounds and escalation policy, all prices in wei
#[derive(Debug, Clone, Deserialize)]
pub struct FeeConfig {
    #[serde(default)]
    pub eip1559_dynamic_fees: bool,
    pub bump_percent: u16,
    #[serde(default)]
    pub bump_min_wei: u64,
    pub bump_threshold: u64,
    pub bump_tx_depth: u32,
    pub limit_default: u64,
    pub price_default_wei: u64,
    pub price_min_wei: u64,
    pub price_max_wei: u64,
    #[serde(default)]
    pub tip_cap_default_wei: u64,
    #[serde(default)]
    pub tip_cap_min_wei: u64,
    #[serde(default)]
    pub price_max_per_key: HashMap<Address, u64>,
}

impl FeeConfig {
    pub fn price_default(&self) -> U256 {
        U256::from(self.price_default_wei)
    }

    pub fn price_min(&self) -> U256 {
        U256::from(self.price_min_wei)
    }

    pub fn price_max(&self) -> U256 {
        U256::from(self.price_max_wei)
    }

    pub fn bump_min(&self) -> U256 {
        U256::from(self.bump_min_wei)
    }

    pub fn tip_cap_default(&self) -> U256 {
        U256::from(self.tip_cap_default_wei)
    }

    pub fn tip_cap_min(&self) -> U256 {
        U256::from(self.tip_cap_min_wei)
    }

    /// Price ceiling for a sender: the global max, lowered by a per-key override
    pub fn price_max_key(&self, address: Address) -> U256 {
        match self.price_max_per_key.get(&address) {
            Some(key_max) => U256::from(*key_max).min(self.price_max()),
            None => self.price_max(),
        }
    }

    fn validate(&self, chain: &str) -> Result<()> {
        if self.price_min_wei > self.price_max_wei {
            anyhow::bail!("Chain {}: price_min_wei exceeds price_max_wei", chain);
        }
        if self.tip_cap_min_wei > self.price_max_wei {
            anyhow::bail!("Chain {}: tip_cap_min_wei exceeds price_max_wei", chain);
        }
        for (address, max) in &self.price_max_per_key {
            if *max < self.price_min_wei {
                anyhow::bail!(
                    "Chain {}: price ceiling for {:?} is below price_min_wei",
                    chain,
                    address
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Resender cadence
    pub fallback_poll_interval_ms: u64,
    pub head_poll_interval_ms: u64,
}

impl ListenerConfig {
    pub fn fallback_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fallback_poll_interval_ms)
    }

    pub fn head_poll_interval(&self) -> Duration {
        Duration::from_millis(self.head_poll_interval_ms)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            fallback_poll_interval_ms: 30_000,
            head_poll_interval_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReaperConfig {
    pub reap_interval_ms: u64,
    pub reap_threshold_secs: u64,
    pub batch_size: u32,
}

impl ReaperConfig {
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn reap_threshold(&self) -> Duration {
        Duration::from_secs(self.reap_threshold_secs)
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            reap_interval_ms: 3_600_000,
            reap_threshold_secs: 7 * 24 * 3600,
            batch_size: 1_000,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_query_timeout_ms() -> u64 {
    10_000
}

fn default_rpc_batch_size() -> u32 {
    250
}

fn default_rpc_timeout_ms() -> u64 {
    10_000
}

fn default_broadcast_interval_ms() -> u64 {
    1_000
}

impl Settings {
    /// Load settings from the file named by `TXM_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("TXM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse settings from TOML text
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        if self.database.backend == StorageBackend::Postgres && self.database.url.is_empty() {
            anyhow::bail!("Postgres backend requires database.url");
        }

        for (name, chain) in &self.chains {
            if !chain.enabled {
                continue;
            }
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
            if chain.rpc_batch_size == 0 {
                anyhow::bail!("Chain {} rpc_batch_size must be at least 1", name);
            }
            if chain.reaper.batch_size == 0 {
                anyhow::bail!("Chain {} reaper batch_size must be at least 1", name);
            }
            chain.fees.validate(name)?;
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by chain ID
    pub fn get_chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain_id == chain_id)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
    }

    ENV_VAR
        .replace_all(input, |cap: &regex::Captures<'_>| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}
