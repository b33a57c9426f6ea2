//! Tx0: the entry transaction splitting a deposit UTXO into premix outputs
//!
//! [`Tx0Service`] holds the injected collaborators (fee economics, fee-proof
//! codec, network) and hands out a staged [`Tx0Builder`] per Tx0:
//!
//! ```no_run
//! # use whirlpool_client::tx0::{Tx0Fees, Tx0Service};
//! # use whirlpool_client::types::{Pool, SpendFromKey, UnspentOutput};
//! # use whirlpool_client::backend::{AddressSource, BackendApi};
//! # fn run(
//! #     backend: &dyn BackendApi,
//! #     addresses: &mut dyn AddressSource,
//! #     key: SpendFromKey,
//! #     utxo: UnspentOutput,
//! # ) -> Result<(), whirlpool_client::error::Tx0Error> {
//! let service = Tx0Service::with_defaults(bitcoin::Network::Bitcoin);
//! let pool = Pool::new_with_defaults("0.5btc", 50_000_000, 500_000, 5, 5);
//!
//! let tx0 = service
//!     .builder(&pool, Tx0Fees::new(10, 10))
//!     .spend_from(vec![key], vec![utxo])
//!     .max_outputs(Some(70))
//!     .build(backend, addresses)?;
//! backend.push_tx(&tx0.hex()).ok();
//! # Ok(())
//! # }
//! ```

pub mod bip69;
pub mod builder;
pub mod fee_proof;
pub mod solver;

use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;

use bitcoin::consensus::encode::serialize_hex;
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Network, OutPoint, Transaction, Txid};
use log::warn;

use crate::backend::BackendApi;
use crate::error::Tx0Error;
use crate::fee_economics::FeeEconomics;
use crate::types::{Pool, Tx0Data};

pub use builder::Tx0Builder;
pub use fee_proof::{Bip47FeeProofCodec, FeeProofCodec, FEE_PROOF_LENGTH};

/// Fee rates used for one Tx0, in sat/vB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tx0Fees {
    /// Rate paid by the Tx0 itself
    pub fee_tx0: u64,
    /// Rate premix outputs must be able to pay in their mix
    pub fee_premix: u64,
}

impl Tx0Fees {
    pub fn new(fee_tx0: u64, fee_premix: u64) -> Self {
        Self { fee_tx0, fee_premix }
    }
}

/// Economics of a Tx0 without building or signing it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tx0Preview {
    pub miner_fee: u64,
    /// Fee amount actually moved to the fee output
    pub pool_fee: u64,
    pub premix_value: u64,
    pub change_value: u64,
    pub nb_premix: u32,
}

impl fmt::Display for Tx0Preview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "minerFee={}, poolFee={}, premixValue={}, changeValue={}, nbPremix={}",
            self.miner_fee, self.pool_fee, self.premix_value, self.change_value, self.nb_premix
        )
    }
}

/// A signed Tx0 and the premix outputs it creates
#[derive(Debug, Clone)]
pub struct Tx0 {
    pub tx: Transaction,
    /// Premix outputs in output order
    pub premix_outputs: Vec<OutPoint>,
    pub preview: Tx0Preview,
}

impl Tx0 {
    pub fn txid(&self) -> Txid {
        self.tx.txid()
    }

    /// Raw transaction hex, ready for broadcast
    pub fn hex(&self) -> String {
        serialize_hex(&self.tx)
    }
}

/// Builds Tx0s with injected fee economics and fee-proof codec
pub struct Tx0Service {
    economics: FeeEconomics,
    codec: Arc<dyn FeeProofCodec>,
    network: Network,
    secp: Secp256k1<All>,
}

impl fmt::Debug for Tx0Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tx0Service")
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

impl Tx0Service {
    pub fn new(network: Network, economics: FeeEconomics, codec: Arc<dyn FeeProofCodec>) -> Self {
        Self {
            economics,
            codec,
            network,
            secp: Secp256k1::new(),
        }
    }

    /// Segwit size estimator and BIP47 fee-proof codec
    pub fn with_defaults(network: Network) -> Self {
        Self::new(
            network,
            FeeEconomics::default(),
            Arc::new(Bip47FeeProofCodec::new()),
        )
    }

    pub fn economics(&self) -> &FeeEconomics {
        &self.economics
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Start a Tx0 for `pool` at the given fee rates
    pub fn builder<'a>(&'a self, pool: &'a Pool, fees: Tx0Fees) -> Tx0Builder<'a> {
        Tx0Builder::new(self, pool, fees)
    }

    /// Fetch fresh fee instructions for `pool_id`
    ///
    /// Not retried: a failure surfaces with the server's message.
    pub fn fetch_tx0_data(
        &self,
        backend: &dyn BackendApi,
        pool_id: &str,
    ) -> Result<Tx0Data, Tx0Error> {
        let response = backend.fetch_tx0_data(pool_id).map_err(|e| {
            warn!("Tx0 data fetch failed for poolId={}: {}", pool_id, e);
            Tx0Error::Tx0DataUnavailable {
                message: e.server_message(),
            }
        })?;
        Tx0Data::try_from(response)
    }

    pub(crate) fn codec(&self) -> &dyn FeeProofCodec {
        self.codec.as_ref()
    }

    pub(crate) fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }
}
