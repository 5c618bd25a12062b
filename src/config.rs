//! Configuration management for the pipeline orchestrator
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub orchestrator: OrchestratorConfig,
    pub networks: HashMap<String, NetworkConfig>,
    pub credentials: HashMap<String, CredentialConfig>,
    pub contracts: ContractsConfig,
    pub amounts: AmountsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Stop scheduling every remaining step once any step fails
    #[serde(default)]
    pub halt_on_failure: bool,
}

fn default_confirmation_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    500
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout_secs: default_confirmation_timeout(),
            poll_interval_ms: default_poll_interval(),
            halt_on_failure: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    /// Name of the entry under `[credentials]` that signs on this network
    pub credential: String,
    #[serde(default)]
    pub gas_price_strategy: GasPriceStrategy,
    pub confirmation_blocks: Option<u64>,
    #[serde(default = "default_max_gas_price")]
    pub max_gas_price_gwei: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_max_gas_price() -> u64 {
    200
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    #[default]
    Eip1559,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialConfig {
    pub private_key_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractsConfig {
    pub weth: String,
    pub dai: String,
    pub router: String,
    pub lending_pool: String,
    pub vault: String,
}

/// Amounts are decimal strings in ether units
#[derive(Debug, Clone, Deserialize)]
pub struct AmountsConfig {
    pub swap_in_eth: String,
    pub borrow_eth: String,
    pub vault_deposit_eth: String,
    #[serde(default = "default_vault_gas_limit")]
    pub vault_gas_limit: u64,
}

fn default_vault_gas_limit() -> u64 {
    4_000_000
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Settings {
    /// Load settings from the configuration file
    pub fn load() -> Result<Self> {
        let config_path = env::var("PIPELINE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse and validate a configuration document
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
        if self.enabled_networks().is_empty() {
            anyhow::bail!("At least one network must be enabled");
        }

        for (name, network) in self.enabled_networks() {
            if network.rpc_url.is_empty() {
                anyhow::bail!("Network {} has no RPC URL configured", name);
            }
            if !self.credentials.contains_key(&network.credential) {
                anyhow::bail!(
                    "Network {} references unknown credential {}",
                    name,
                    network.credential
                );
            }
        }

        for (label, address) in self.contracts.entries() {
            parse_address(address).with_context(|| format!("Invalid {} address", label))?;
        }

        Ok(())
    }

    /// Get list of enabled networks, sorted by name
    pub fn enabled_networks(&self) -> Vec<(&String, &NetworkConfig)> {
        let mut networks: Vec<_> = self.networks.iter().filter(|(_, n)| n.enabled).collect();
        networks.sort_by(|a, b| a.0.cmp(b.0));
        networks
    }

    /// Get network config by chain ID
    pub fn get_network_by_id(&self, chain_id: u64) -> Option<&NetworkConfig> {
        self.networks.values().find(|n| n.chain_id == chain_id)
    }
}

impl ContractsConfig {
    fn entries(&self) -> [(&'static str, &String); 5] {
        [
            ("weth", &self.weth),
            ("dai", &self.dai),
            ("router", &self.router),
            ("lending_pool", &self.lending_pool),
            ("vault", &self.vault),
        ]
    }
}

/// Parse a hex address string
pub fn parse_address(value: &str) -> Result<Address> {
    value
        .parse::<Address>()
        .map_err(|e| anyhow::anyhow!("{}: {}", value, e))
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
    }

    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}
