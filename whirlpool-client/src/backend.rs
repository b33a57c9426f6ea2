//! Collaborators consumed by the core: backend data source and address source
//!
//! The HTTP transport behind [`BackendApi`] belongs to the embedding wallet.
//! This module only defines the contract and the fee-rate policy layered on
//! top of it.

use bitcoin::Address;
use log::{error, warn};
use serde_json::json;
use thiserror::Error;

use crate::config::BackendConfig;
use crate::logging::{log_backend, LogLevel};
use crate::types::{Tx0DataResponse, UnspentOutput, WhirlpoolAccount};

/// Errors reported by a backend implementation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Server answered with an error status, optionally with its own message
    #[error("HTTP {status}{}", .message.as_ref().map(|m| format!(": {}", m)).unwrap_or_default())]
    Http { status: u16, message: Option<String> },

    /// Server could not be reached
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Server answered with something unparsable
    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    /// Message to surface to the user, preferring the server's own
    pub fn server_message(&self) -> String {
        match self {
            BackendError::Http {
                message: Some(message),
                ..
            } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Wallet backend: chain data, fee rates, coordinator Tx0 data and broadcast
pub trait BackendApi: Send + Sync {
    fn fetch_utxos(&self, account: WhirlpoolAccount) -> Result<Vec<UnspentOutput>, BackendError>;

    /// Raw fee rate estimate in sat/vB, before any policy is applied
    fn fetch_fee_per_byte(&self) -> Result<u64, BackendError>;

    fn fetch_tx0_data(&self, pool_id: &str) -> Result<Tx0DataResponse, BackendError>;

    fn push_tx(&self, tx_hex: &str) -> Result<(), BackendError>;
}

/// Deterministic HD address derivation, owned by the wallet
pub trait AddressSource {
    fn next_premix_address(&mut self) -> Address;

    fn next_change_address(&mut self) -> Address;
}

/// Fee-rate policy: one retry, failover rate, hard ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeRateProvider {
    max_fee_per_byte: u64,
    failover_fee_per_byte: u64,
}

impl Default for FeeRateProvider {
    fn default() -> Self {
        Self::from_config(&BackendConfig::default())
    }
}

impl FeeRateProvider {
    pub fn new(max_fee_per_byte: u64, failover_fee_per_byte: u64) -> Self {
        Self {
            max_fee_per_byte,
            failover_fee_per_byte,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(config.max_fee_per_byte, config.failover_fee_per_byte)
    }

    /// Fetch a fee rate from `backend`
    ///
    /// A failure or a rate below 1 is retried once. If the retry also fails
    /// the failover rate is returned. Any fetched rate is capped at the max.
    pub fn fetch_fee_per_byte(&self, backend: &dyn BackendApi) -> u64 {
        for attempt in 1..=2 {
            match backend.fetch_fee_per_byte() {
                Ok(fee) if fee >= 1 => return fee.min(self.max_fee_per_byte),
                Ok(fee) => warn!("Invalid fee rate from server: {} (attempt {})", fee, attempt),
                Err(e) => error!("Invalid fee response from server: {} (attempt {})", e, attempt),
            }
        }

        log_backend(
            LogLevel::Warn,
            "fee rate unavailable, using failover",
            Some(json!({ "failoverFeePerByte": self.failover_fee_per_byte })),
        );
        self.failover_fee_per_byte
    }
}
