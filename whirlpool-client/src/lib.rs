//! Whirlpool Client Core
//!
//! Tx0 construction and mix scheduling for a Whirlpool CoinJoin wallet.
//!
//! # Modules
//!
//! - `types`: Pools, Tx0 data, UTXOs and their mix state
//! - `fee_economics`: Premix values, Tx0 miner fees and spend totals
//! - `tx0`: Premix output solver, fee proof codec and the Tx0 builder
//! - `pool_eligibility`: Which pools a UTXO can enter
//! - `utxo_store`: Shared registry of the wallet's UTXOs
//! - `mix`: Mix admission scheduler and the session runner contract
//! - `backend`: Backend data source contract and fee rate policy
//! - `persistence`: Per-UTXO mix configuration file
//! - `config`: Configuration management
//! - `logging`: Context-tagged logging
//! - `error`: Error taxonomy
//!
//! # Security Considerations
//!
//! - Spend-from key bytes are zeroized on drop and never logged
//! - Addresses and txids are truncated in log output
//! - Every Tx0 is verified (value balance, fee proof output, signatures)
//!   before it is returned

/// Core domain types
pub mod types;

/// Error taxonomy
pub mod error;

/// Context-tagged logging
pub mod logging;

/// Configuration management
pub mod config;

/// Fee arithmetic for Tx0 and premix outputs
pub mod fee_economics;

/// Backend data source contract
pub mod backend;

/// Tx0 construction
pub mod tx0;

/// Pool eligibility
pub mod pool_eligibility;

/// Per-UTXO mix configuration persistence
pub mod persistence;

/// Shared UTXO registry
pub mod utxo_store;

/// Mix scheduling
pub mod mix;

pub use backend::{AddressSource, BackendApi, BackendError, FeeRateProvider};
pub use config::Config;
pub use error::{ErrorCategory, Tx0Error, WhirlpoolError, WhirlpoolResult};
pub use fee_economics::{FeeEconomics, SegwitSizeEstimator, TxSizeEstimator};
pub use mix::{
    DefaultUtxoPriority, MixListener, MixScheduler, MixSchedulerHandle, MixSchedulerState,
    MixSessionHandle, MixSessionRunner, SchedulerError, UtxoPriority,
};
pub use persistence::{UtxoConfig, UtxoConfigHandler};
pub use pool_eligibility::PoolSelector;
pub use tx0::{Tx0, Tx0Builder, Tx0Fees, Tx0Preview, Tx0Service};
pub use types::{
    Pool, SpendFromKey, Tx0Data, UnspentOutput, WhirlpoolAccount, WhirlpoolUtxo,
    WhirlpoolUtxoStatus,
};
pub use utxo_store::{RefreshChanges, UtxoStore};

pub use bitcoin::{Address, Network, OutPoint, Transaction, Txid};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

use std::sync::Once;

static INIT: Once = Once::new();

/// Library initialization
///
/// Sets up default logging. Safe to call more than once; only the first call
/// does anything.
pub fn init() -> Result<(), String> {
    let mut result = Ok(());
    INIT.call_once(|| {
        let config = logging::LogConfig::default();
        result = logging::init(&config).map_err(|e| format!("Failed to initialize logging: {}", e));
    });
    result
}
