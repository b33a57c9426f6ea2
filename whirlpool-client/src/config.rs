//! Configuration management for the Whirlpool client core.
//!
//! Settings are stored in TOML. Every field has a default so a partial file
//! (or an empty one) still yields a usable configuration.
//!
//! ## Security Considerations
//!
//! - No key material is ever stored here
//! - All values must pass [`Config::validate`] before the scheduler or the
//!   fee-rate provider is built from them

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bitcoin::Network;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid configuration values
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid network type: {0}")]
    InvalidNetwork(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub wallet: WalletConfig,

    #[serde(default)]
    pub tx0: Tx0Config,

    #[serde(default)]
    pub mix: MixConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalletConfig {
    /// "bitcoin", "testnet", "signet" or "regtest"
    #[serde(default = "default_network")]
    pub network: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
        }
    }
}

/// Tx0 sizing options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tx0Config {
    /// Optional cap on premix outputs per Tx0
    #[serde(default)]
    pub max_outputs: Option<u32>,

    /// Minimum premix outputs a pool must accept to be eligible
    #[serde(default = "default_nb_outputs_min")]
    pub nb_outputs_min: u32,
}

impl Default for Tx0Config {
    fn default() -> Self {
        Self {
            max_outputs: None,
            nb_outputs_min: default_nb_outputs_min(),
        }
    }
}

/// Mix scheduler options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MixConfig {
    /// Maximum number of concurrently mixing UTXOs
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Minimum delay between two mix session starts
    #[serde(default = "default_client_delay_secs")]
    pub client_delay_secs: u64,

    #[serde(default = "default_min_confirmations")]
    pub min_confirmations: u32,

    /// Put a UTXO back in the queue after a failed mix
    #[serde(default = "default_true")]
    pub requeue_on_failure: bool,
}

impl MixConfig {
    pub fn client_delay(&self) -> Duration {
        Duration::from_secs(self.client_delay_secs)
    }
}

impl Default for MixConfig {
    fn default() -> Self {
        Self {
            max_clients: default_max_clients(),
            client_delay_secs: default_client_delay_secs(),
            min_confirmations: default_min_confirmations(),
            requeue_on_failure: default_true(),
        }
    }
}

/// Fee-rate policy applied on top of the backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// Upper bound on any fetched fee rate (sat/vB)
    #[serde(default = "default_max_fee_per_byte")]
    pub max_fee_per_byte: u64,

    /// Rate used when the backend cannot supply one (sat/vB)
    #[serde(default = "default_failover_fee_per_byte")]
    pub failover_fee_per_byte: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            max_fee_per_byte: default_max_fee_per_byte(),
            failover_fee_per_byte: default_failover_fee_per_byte(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistenceConfig {
    #[serde(default = "default_utxo_config_file")]
    pub utxo_config_file: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            utxo_config_file: default_utxo_config_file(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path.display(), e))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| anyhow!("Failed to parse config file: {}", e))?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| anyhow!("Failed to serialize config: {}", e))?;

        fs::write(path, content)
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path.display(), e))?;

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network()?;

        if self.mix.max_clients == 0 {
            return Err(ConfigError::InvalidValue {
                field: "mix.max_clients",
                reason: "must be greater than 0".to_string(),
            });
        }

        if self.tx0.nb_outputs_min == 0 {
            return Err(ConfigError::InvalidValue {
                field: "tx0.nb_outputs_min",
                reason: "must be greater than 0".to_string(),
            });
        }

        if self.tx0.max_outputs == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "tx0.max_outputs",
                reason: "must be greater than 0 when set".to_string(),
            });
        }

        if self.backend.max_fee_per_byte == 0 {
            return Err(ConfigError::InvalidValue {
                field: "backend.max_fee_per_byte",
                reason: "must be greater than 0".to_string(),
            });
        }

        if self.backend.failover_fee_per_byte > self.backend.max_fee_per_byte {
            return Err(ConfigError::InvalidValue {
                field: "backend.failover_fee_per_byte",
                reason: format!(
                    "{} exceeds max_fee_per_byte {}",
                    self.backend.failover_fee_per_byte, self.backend.max_fee_per_byte
                ),
            });
        }

        Ok(())
    }

    /// Parsed bitcoin network
    pub fn network(&self) -> Result<Network, ConfigError> {
        match self.wallet.network.as_str() {
            "bitcoin" | "testnet" | "signet" | "regtest" => Network::from_str(&self.wallet.network)
                .map_err(|_| ConfigError::InvalidNetwork(self.wallet.network.clone())),
            other => Err(ConfigError::InvalidNetwork(other.to_string())),
        }
    }
}

/// Ensure a configuration file exists at the specified path
/// If it doesn't exist, create it with default values
pub fn ensure_config_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        let content = toml::to_string_pretty(&Config::default())
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .map_err(|e| anyhow!("Failed to create config directory: {}", e))?;
            }
        }

        fs::write(path, content)
            .map_err(|e| anyhow!("Failed to write default config file: {}", e))?;
    }

    Ok(())
}

// Default value functions

fn default_network() -> String {
    "bitcoin".to_string()
}

fn default_true() -> bool {
    true
}

fn default_nb_outputs_min() -> u32 {
    1
}

fn default_max_clients() -> usize {
    5
}

fn default_client_delay_secs() -> u64 {
    15
}

fn default_min_confirmations() -> u32 {
    crate::types::MIX_MIN_CONFIRMATIONS
}

fn default_max_fee_per_byte() -> u64 {
    500
}

fn default_failover_fee_per_byte() -> u64 {
    400
}

fn default_utxo_config_file() -> String {
    "whirlpool-utxos.json".to_string()
}
