//! Configuration management for the wallet transaction engine
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub engine: EngineConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub wallet: WalletConfig,
    pub chains: HashMap<String, ChainConfig>,
    /// Origin -> accounts the origin may transact from
    #[serde(default)]
    pub permissions: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of records kept in the store
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_gas_buffer_multiplier")]
    pub gas_buffer_multiplier: f64,
    /// Seconds added to node time for ledgers that require an expiration
    #[serde(default = "default_expiry_secs")]
    pub default_expiry_secs: u64,
    /// Consecutive observations required before a transaction is dropped
    #[serde(default = "default_dropped_buffer_count")]
    pub dropped_buffer_count: u32,
    #[serde(default = "default_offline_timeout_secs")]
    pub offline_timeout_secs: u64,
    #[serde(default = "default_block_poll_interval_ms")]
    pub block_poll_interval_ms: u64,
    /// Chain selector new requests default to
    pub default_chain: String,
}

fn default_history_limit() -> usize {
    1000
}

fn default_gas_buffer_multiplier() -> f64 {
    1.5
}

fn default_expiry_secs() -> u64 {
    1800
}

fn default_dropped_buffer_count() -> u32 {
    3
}

fn default_offline_timeout_secs() -> u64 {
    300
}

fn default_block_poll_interval_ms() -> u64 {
    4000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            gas_buffer_multiplier: default_gas_buffer_multiplier(),
            default_expiry_secs: default_expiry_secs(),
            dropped_buffer_count: default_dropped_buffer_count(),
            offline_timeout_secs: default_offline_timeout_secs(),
            block_poll_interval_ms: default_block_poll_interval_ms(),
            default_chain: "eth:1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

fn default_true() -> bool {
    true
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
    /// Environment variable holding the hex private key of the selected account
    pub private_key_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Selector records are keyed by, e.g. `eth:1`
    pub selector: String,
    pub name: String,
    pub protocol: ChainProtocol,
    pub rpc_urls: Vec<String>,
    pub chain_id: Option<u64>,
    pub max_gas_price_gwei: Option<u64>,
    /// Gas limit of a plain value transfer; protocol default when unset
    pub transfer_gas_limit: Option<u64>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChainProtocol {
    Evm,
    Ledger,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("WALLET_TX_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        // At least one chain must be enabled
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (name, chain) in &self.chains {
            if chain.enabled && chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
        }

        if !self
            .enabled_chains()
            .iter()
            .any(|(_, c)| c.selector == self.engine.default_chain)
        {
            anyhow::bail!(
                "Default chain {} is not an enabled chain",
                self.engine.default_chain
            );
        }

        if self.engine.gas_buffer_multiplier < 1.0 {
            anyhow::bail!("Gas buffer multiplier must be at least 1.0");
        }

        if self.engine.dropped_buffer_count == 0 {
            anyhow::bail!("Dropped buffer count must be positive");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
