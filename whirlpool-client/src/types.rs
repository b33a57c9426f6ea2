//! Common data types for the Whirlpool client core
//!
//! These types describe pools, coordinator fee instructions, chain UTXOs and
//! the mix bookkeeping layered on top of them. Apart from [`SpendFromKey`],
//! they are designed to be serializable and to NOT contain sensitive
//! cryptographic material.
//!
//! # Security Boundaries
//!
//! - `Pool`, `Tx0Data` and `UnspentOutput` cross the backend boundary and are
//!   treated as untrusted input until validated by the Tx0 builder
//! - `SpendFromKey` holds raw private key bytes and is zeroed on drop; it never
//!   implements `Serialize` or a revealing `Debug`

use std::convert::TryFrom;
use std::fmt;

use bitcoin::secp256k1::SecretKey;
use bitcoin::{OutPoint, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::Tx0Error;

/// Hard protocol ceiling on premix outputs per Tx0
pub const NB_PREMIX_MAX: u32 = 600;

/// Default number of confirmations a queued UTXO needs before it may mix
pub const MIX_MIN_CONFIRMATIONS: u32 = 1;

/// Mixing-round parameters of a pool, immutable once fetched for a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    /// Pool identifier, e.g. "0.5btc"
    pub pool_id: String,
    /// Target premix value before the miner-fee margin
    pub denomination: u64,
    /// Flat coordinator fee owed per Tx0
    pub fee_value: u64,
    /// Lowest acceptable premix output value
    pub premix_balance_min: u64,
    /// Soft upper bound on premix output value
    pub premix_balance_cap: u64,
    /// Hard upper bound on premix output value
    pub premix_balance_max: u64,
    /// Minimum number of non-fee-paying participants of a mix round
    pub min_must_mix: u32,
    /// Number of equal inputs/outputs of a mix round
    pub mix_anonymity_set: u32,
    /// Coordinator-side cap on premix outputs per Tx0 (`None` means no pool cap)
    #[serde(default)]
    pub tx0_max_outputs: Option<u32>,
}

impl Pool {
    /// Build a pool whose premix bounds are derived from the denomination.
    ///
    /// The floor leaves room for a minimal mix fee contribution, the cap allows
    /// up to 1% of the denomination as fee margin and the max allows 2%.
    pub fn new_with_defaults(
        pool_id: impl Into<String>,
        denomination: u64,
        fee_value: u64,
        min_must_mix: u32,
        mix_anonymity_set: u32,
    ) -> Self {
        Self {
            pool_id: pool_id.into(),
            denomination,
            fee_value,
            premix_balance_min: denomination + 1,
            premix_balance_cap: denomination + denomination / 100,
            premix_balance_max: denomination + denomination / 50,
            min_must_mix,
            mix_anonymity_set,
            tx0_max_outputs: None,
        }
    }
}

/// Per-pool fee-collection instructions, fetched fresh before each Tx0 and
/// used exactly once.
#[derive(Clone, PartialEq, Eq)]
pub struct Tx0Data {
    /// BIP47 payment code of the fee recipient
    pub fee_payment_code: String,
    /// Fee to pay to the coordinator now
    pub fee_value: i64,
    /// Fee returned to the wallet when payment is deferred
    pub fee_change: i64,
    /// Opaque bytes embedded in the fee-proof output
    pub fee_payload: Vec<u8>,
    /// Coordinator fee address (bech32)
    pub fee_address: Option<String>,
    /// Index into the fee-derivation sequence
    pub fee_indice: u32,
}

impl fmt::Debug for Tx0Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tx0Data")
            .field("fee_value", &self.fee_value)
            .field("fee_change", &self.fee_change)
            .field("fee_indice", &self.fee_indice)
            .field("fee_payload_len", &self.fee_payload.len())
            .finish()
    }
}

/// Wire form of [`Tx0Data`] as returned by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tx0DataResponse {
    pub fee_payment_code: String,
    pub fee_value: i64,
    pub fee_change: i64,
    /// Base64 encoded fee payload
    #[serde(default)]
    pub fee_payload64: Option<String>,
    #[serde(default)]
    pub fee_address: Option<String>,
    #[serde(default)]
    pub fee_indice: u32,
}

impl TryFrom<Tx0DataResponse> for Tx0Data {
    type Error = Tx0Error;

    fn try_from(response: Tx0DataResponse) -> Result<Self, Self::Error> {
        let fee_payload = match response.fee_payload64.as_deref() {
            Some(encoded) if !encoded.is_empty() => base64::decode(encoded).map_err(|e| {
                Tx0Error::InvalidTx0Data(format!("fee payload is not valid base64: {}", e))
            })?,
            _ => Vec::new(),
        };

        Ok(Tx0Data {
            fee_payment_code: response.fee_payment_code,
            fee_value: response.fee_value,
            fee_change: response.fee_change,
            fee_payload,
            fee_address: response.fee_address,
            fee_indice: response.fee_indice,
        })
    }
}

/// Immutable snapshot of a chain UTXO as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
    pub tx_hash: Txid,
    pub index: u32,
    /// Value in satoshis
    pub value: u64,
    pub confirmations: u32,
}

impl UnspentOutput {
    pub fn new(tx_hash: Txid, index: u32, value: u64, confirmations: u32) -> Self {
        Self {
            tx_hash,
            index,
            value,
            confirmations,
        }
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.tx_hash, self.index)
    }

    /// UTXO-unique key, `<txid>:<vout>`
    pub fn key(&self) -> String {
        format!("{}:{}", self.tx_hash, self.index)
    }
}

impl fmt::Display for UnspentOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} sats, {} confirmations)",
            self.key(),
            self.value,
            self.confirmations
        )
    }
}

/// Wallet account a UTXO belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WhirlpoolAccount {
    Deposit,
    Premix,
    Postmix,
}

impl WhirlpoolAccount {
    pub const ALL: [WhirlpoolAccount; 3] = [
        WhirlpoolAccount::Deposit,
        WhirlpoolAccount::Premix,
        WhirlpoolAccount::Postmix,
    ];
}

impl fmt::Display for WhirlpoolAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WhirlpoolAccount::Deposit => "DEPOSIT",
            WhirlpoolAccount::Premix => "PREMIX",
            WhirlpoolAccount::Postmix => "POSTMIX",
        };
        f.write_str(name)
    }
}

/// Mix lifecycle of a managed UTXO
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WhirlpoolUtxoStatus {
    Ready,
    MixQueue,
    Mixing,
    MixSuccess,
    MixFailed,
}

impl fmt::Display for WhirlpoolUtxoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WhirlpoolUtxoStatus::Ready => "READY",
            WhirlpoolUtxoStatus::MixQueue => "MIX_QUEUE",
            WhirlpoolUtxoStatus::Mixing => "MIXING",
            WhirlpoolUtxoStatus::MixSuccess => "MIX_SUCCESS",
            WhirlpoolUtxoStatus::MixFailed => "MIX_FAILED",
        };
        f.write_str(name)
    }
}

/// A chain UTXO plus its mutable mix bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhirlpoolUtxo {
    pub utxo: UnspentOutput,
    pub account: WhirlpoolAccount,
    pub status: WhirlpoolUtxoStatus,
    /// Assigned pool, if any
    pub pool_id: Option<String>,
    pub mixs_done: u32,
    pub mixs_target: u32,
    /// Last status change, used for queue-age ordering
    pub last_activity: DateTime<Utc>,
}

impl WhirlpoolUtxo {
    /// A freshly discovered UTXO starts `READY` with no mixes done.
    pub fn new(utxo: UnspentOutput, account: WhirlpoolAccount) -> Self {
        Self {
            utxo,
            account,
            status: WhirlpoolUtxoStatus::Ready,
            pool_id: None,
            mixs_done: 0,
            mixs_target: 1,
            last_activity: Utc::now(),
        }
    }

    pub fn with_pool(mut self, pool_id: impl Into<String>) -> Self {
        self.pool_id = Some(pool_id.into());
        self
    }

    pub fn key(&self) -> String {
        self.utxo.key()
    }

    pub fn set_status(&mut self, status: WhirlpoolUtxoStatus) {
        self.status = status;
        self.last_activity = Utc::now();
    }

    /// True when more mixes are still wanted for this UTXO
    pub fn has_mixs_remaining(&self) -> bool {
        self.mixs_done < self.mixs_target
    }
}

impl fmt::Display for WhirlpoolUtxo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} status={} pool={} mixs={}/{}",
            self.account,
            self.utxo,
            self.status,
            self.pool_id.as_deref().unwrap_or("-"),
            self.mixs_done,
            self.mixs_target
        )
    }
}

/// Raw private key bytes of a funding UTXO, zeroed when dropped
///
/// # Security
///
/// The bytes are only turned into a `SecretKey` at signing and fee-proof
/// time. `Debug` never prints the content.
#[derive(Zeroize)]
pub struct SpendFromKey {
    inner: [u8; 32],
}

impl SpendFromKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self { inner: bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, Tx0Error> {
        if bytes.len() != 32 {
            return Err(Tx0Error::InvalidArgument(format!(
                "private key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut inner = [0u8; 32];
        inner.copy_from_slice(bytes);
        Ok(Self { inner })
    }

    pub fn secret_key(&self) -> Result<SecretKey, Tx0Error> {
        SecretKey::from_slice(&self.inner)
            .map_err(|e| Tx0Error::InvalidArgument(format!("invalid private key: {}", e)))
    }
}

impl From<SecretKey> for SpendFromKey {
    fn from(key: SecretKey) -> Self {
        Self::new(key.secret_bytes())
    }
}

impl fmt::Debug for SpendFromKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpendFromKey([REDACTED])")
    }
}

impl Drop for SpendFromKey {
    fn drop(&mut self) {
        self.inner.zeroize();
    }
}
