//! Staged Tx0 construction
//!
//! A builder collects the funding inputs and optional overrides, then either
//! previews the economics or assembles, signs and verifies the transaction.

use std::collections::HashSet;
use std::str::FromStr;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::script::PushBytesBuf;
use bitcoin::secp256k1::{Message, PublicKey as SecpPublicKey, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    Address, OutPoint, PublicKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use log::{debug, info};
use serde_json::json;

use crate::backend::{AddressSource, BackendApi};
use crate::error::Tx0Error;
use crate::fee_economics::FeeEconomics;
use crate::logging::{log_tx0, sanitize_for_logging, LogLevel};
use crate::types::{Pool, SpendFromKey, Tx0Data, UnspentOutput};

use super::bip69;
use super::fee_proof::FEE_PROOF_LENGTH;
use super::solver::{cap_nb_premix, compute_nb_premix_max};
use super::{Tx0, Tx0Fees, Tx0Preview, Tx0Service};

const TX0_VERSION: i32 = 1;

/// Where the fee output goes and how much it carries
struct FeeDestination {
    fee_indice: u32,
    address: Address,
    amount: u64,
}

/// Staged configuration for one Tx0
pub struct Tx0Builder<'a> {
    service: &'a Tx0Service,
    pool: &'a Pool,
    fees: Tx0Fees,
    spend_from_keys: Vec<SpendFromKey>,
    spend_froms: Vec<UnspentOutput>,
    max_outputs: Option<u32>,
    tx0_data: Option<Tx0Data>,
    premix_value: Option<u64>,
}

impl<'a> Tx0Builder<'a> {
    pub(crate) fn new(service: &'a Tx0Service, pool: &'a Pool, fees: Tx0Fees) -> Self {
        Self {
            service,
            pool,
            fees,
            spend_from_keys: Vec::new(),
            spend_froms: Vec::new(),
            max_outputs: None,
            tx0_data: None,
            premix_value: None,
        }
    }

    /// Funding UTXOs and their private keys, in matching order
    pub fn spend_from(mut self, keys: Vec<SpendFromKey>, utxos: Vec<UnspentOutput>) -> Self {
        self.spend_from_keys = keys;
        self.spend_froms = utxos;
        self
    }

    /// Optional cap on premix outputs
    pub fn max_outputs(mut self, max_outputs: Option<u32>) -> Self {
        self.max_outputs = max_outputs;
        self
    }

    /// Use already fetched fee instructions instead of fetching them on build
    pub fn tx0_data(mut self, tx0_data: Tx0Data) -> Self {
        self.tx0_data = Some(tx0_data);
        self
    }

    /// Use an explicit premix value instead of the pool computation
    pub fn premix_value(mut self, premix_value: u64) -> Self {
        self.premix_value = Some(premix_value);
        self
    }

    fn economics(&self) -> &FeeEconomics {
        self.service.economics()
    }

    fn spend_from_balance(&self) -> u64 {
        self.spend_froms.iter().map(|utxo| utxo.value).sum()
    }

    fn check_arity(&self) -> Result<(), Tx0Error> {
        if self.spend_from_keys.len() != self.spend_froms.len() {
            return Err(Tx0Error::InvalidArgument(format!(
                "spendFromPrivKeys count vs spendFroms count mismatch: {} != {}",
                self.spend_from_keys.len(),
                self.spend_froms.len()
            )));
        }
        if self.spend_froms.is_empty() {
            return Err(Tx0Error::InvalidArgument("spendFroms should be > 0".to_string()));
        }
        if self.spend_froms.len() != 1 {
            return Err(Tx0Error::InvalidArgument(format!(
                "Tx0 supports exactly one spendFrom, got {}",
                self.spend_froms.len()
            )));
        }
        Ok(())
    }

    fn check_balance_min(&self) -> Result<u64, Tx0Error> {
        let balance = self.spend_from_balance();
        let balance_min = self.economics().compute_spend_from_balance_min(
            self.pool,
            self.fees.fee_tx0,
            self.fees.fee_premix,
            1,
        );
        if balance < balance_min {
            return Err(Tx0Error::InsufficientBalance {
                balance,
                required: balance_min,
            });
        }
        Ok(balance)
    }

    /// Caller cap combined with the pool's own cap
    fn effective_max_outputs(&self) -> Option<u32> {
        match (self.max_outputs, self.pool.tx0_max_outputs) {
            (Some(caller), Some(pool)) => Some(caller.min(pool)),
            (caller, pool) => caller.or(pool),
        }
    }

    fn resolve_premix_value(&self) -> Result<u64, Tx0Error> {
        let premix_value = match self.premix_value {
            Some(premix_value) => premix_value,
            None => {
                return Ok(self
                    .economics()
                    .compute_premix_value(self.pool, self.fees.fee_premix))
            }
        };
        let pool = self.pool;
        if premix_value < pool.premix_balance_min || premix_value > pool.premix_balance_max {
            return Err(Tx0Error::InvalidArgument(format!(
                "premixValue {} outside of pool bounds [{}, {}]",
                premix_value, pool.premix_balance_min, pool.premix_balance_max
            )));
        }
        Ok(premix_value)
    }

    /// Solve the output count and change for a known fee amount
    fn compute_preview(
        &self,
        balance: u64,
        premix_value: u64,
        fee_amount: u64,
    ) -> Result<Tx0Preview, Tx0Error> {
        let nb_spend_froms = self.spend_froms.len();
        let nb_premix = compute_nb_premix_max(
            self.economics(),
            premix_value,
            balance,
            fee_amount,
            self.fees.fee_tx0,
            nb_spend_froms,
        );
        let max_outputs = self.effective_max_outputs();
        let nb_premix = cap_nb_premix(nb_premix, max_outputs);

        if nb_premix < 1 {
            return Err(Tx0Error::NoPremixOutputs {
                nb_premix,
                balance,
                premix_value,
                pool_fee: fee_amount,
                fee_tx0: self.fees.fee_tx0,
                max_outputs,
            });
        }

        let miner_fee =
            self.economics().compute_tx0_miner_fee(nb_premix, self.fees.fee_tx0, nb_spend_froms);
        let spend_value =
            FeeEconomics::compute_tx0_spend_value(premix_value, nb_premix, fee_amount, miner_fee);
        let change_value = balance
            .checked_sub(spend_value)
            .ok_or(Tx0Error::NegativeChange {
                balance,
                nb_premix,
                premix_value,
                fee_amount,
                miner_fee,
                spend_value,
            })?;

        Ok(Tx0Preview {
            miner_fee,
            pool_fee: fee_amount,
            premix_value,
            change_value,
            nb_premix,
        })
    }

    /// Economics of this Tx0 without touching addresses or keys
    ///
    /// Uses the overridden Tx0 data when set, otherwise the pool's flat fee.
    pub fn preview(&self) -> Result<Tx0Preview, Tx0Error> {
        self.check_arity()?;
        let balance = self.check_balance_min()?;
        let premix_value = self.resolve_premix_value()?;
        let fee_amount = match &self.tx0_data {
            Some(tx0_data) => fee_amount(tx0_data)?,
            None => self.pool.fee_value,
        };
        self.compute_preview(balance, premix_value, fee_amount)
    }

    /// Assemble, sign and verify the Tx0
    ///
    /// Fetches fresh Tx0 data from `backend` unless it was overridden.
    pub fn build(
        self,
        backend: &dyn BackendApi,
        addresses: &mut dyn AddressSource,
    ) -> Result<Tx0, Tx0Error> {
        self.check_arity()?;

        info!(
            " • Tx0: spendFrom={}, feeTx0={}, feePremix={}, poolId={}, maxOutputs={}",
            self.spend_froms
                .iter()
                .map(|utxo| format!("{} ({} sats)", sanitize_for_logging(&utxo.key()), utxo.value))
                .collect::<Vec<_>>()
                .join(", "),
            self.fees.fee_tx0,
            self.fees.fee_premix,
            self.pool.pool_id,
            self.effective_max_outputs()
                .map(|m| m.to_string())
                .unwrap_or_else(|| "*".to_string())
        );

        let balance = self.check_balance_min()?;
        let premix_value = self.resolve_premix_value()?;

        let tx0_data = match &self.tx0_data {
            Some(tx0_data) => tx0_data.clone(),
            None => self.service.fetch_tx0_data(backend, &self.pool.pool_id)?,
        };

        let destination = self.fee_destination(&tx0_data, addresses)?;

        let secret_key = self.spend_from_keys[0].secret_key()?;
        let spend_from = &self.spend_froms[0];
        let op_return_value = self.service.codec().encode(
            &secret_key,
            &tx0_data.fee_payment_code,
            destination.fee_indice,
            &tx0_data.fee_payload,
            &spend_from.outpoint(),
        )?;
        if op_return_value.len() != FEE_PROOF_LENGTH {
            return Err(Tx0Error::InvalidFeeProofLength {
                expected: FEE_PROOF_LENGTH,
                actual: op_return_value.len(),
            });
        }
        debug!(
            "opReturnValue={} (feeIndice={}, feePayloadLen={})",
            hex::encode(&op_return_value),
            destination.fee_indice,
            tx0_data.fee_payload.len()
        );

        let preview = self.compute_preview(balance, premix_value, destination.amount)?;

        let (tx, premix_outputs) = self.build_tx0(
            &secret_key,
            &preview,
            &destination,
            op_return_value,
            addresses,
        )?;

        verify_tx0(self.service, &tx, &self.spend_froms, preview.miner_fee)?;

        let vsize = tx.vsize() as u64;
        log_tx0(
            LogLevel::Info,
            "Tx0 built",
            Some(json!({
                "txid": tx.txid().to_string(),
                "poolId": self.pool.pool_id,
                "nbPremix": preview.nb_premix,
                "premixValue": preview.premix_value,
                "changeValue": preview.change_value,
                "minerFee": preview.miner_fee,
                "poolFee": preview.pool_fee,
                "vsize": vsize,
                "feePrice": preview.miner_fee / vsize.max(1),
            })),
        );

        Ok(Tx0 {
            tx,
            premix_outputs,
            preview,
        })
    }

    /// Pay the coordinator when a fee is due, otherwise send the deferred
    /// fee back to a fresh change address
    fn fee_destination(
        &self,
        tx0_data: &Tx0Data,
        addresses: &mut dyn AddressSource,
    ) -> Result<FeeDestination, Tx0Error> {
        let amount = fee_amount(tx0_data)?;

        if tx0_data.fee_value > 0 {
            let encoded = tx0_data.fee_address.as_deref().ok_or_else(|| {
                Tx0Error::InvalidTx0Data("feeAddress is required when feeValue > 0".to_string())
            })?;
            let address = Address::from_str(encoded)
                .map_err(|e| Tx0Error::InvalidAddress(e.to_string()))?
                .require_network(self.service.network())
                .map_err(|e| Tx0Error::InvalidAddress(e.to_string()))?;
            debug!(
                "feeAddressDestination: coordinator => feeAddress={}, feeIndice={}, fee={}",
                sanitize_for_logging(encoded),
                tx0_data.fee_indice,
                amount
            );
            Ok(FeeDestination {
                fee_indice: tx0_data.fee_indice,
                address,
                amount,
            })
        } else {
            let address = addresses.next_change_address();
            debug!(
                "feeAddressDestination: deposit => feeAddress={}, fee={}",
                sanitize_for_logging(&address.to_string()),
                amount
            );
            Ok(FeeDestination {
                fee_indice: 0,
                address,
                amount,
            })
        }
    }

    fn build_tx0(
        &self,
        secret_key: &SecretKey,
        preview: &Tx0Preview,
        destination: &FeeDestination,
        op_return_value: Vec<u8>,
        addresses: &mut dyn AddressSource,
    ) -> Result<(Transaction, Vec<OutPoint>), Tx0Error> {
        let mut outputs = Vec::with_capacity(preview.nb_premix as usize + 3);
        let mut premix_scripts = HashSet::with_capacity(preview.nb_premix as usize);

        for _ in 0..preview.nb_premix {
            let script_pubkey = addresses.next_premix_address().script_pubkey();
            if !premix_scripts.insert(script_pubkey.clone()) {
                return Err(Tx0Error::InvalidAddress("premix address reused".to_string()));
            }
            outputs.push(TxOut {
                value: preview.premix_value,
                script_pubkey,
            });
        }

        if preview.change_value > 0 {
            outputs.push(TxOut {
                value: preview.change_value,
                script_pubkey: addresses.next_change_address().script_pubkey(),
            });
        }

        outputs.push(TxOut {
            value: destination.amount,
            script_pubkey: destination.address.script_pubkey(),
        });

        let push = PushBytesBuf::try_from(op_return_value)
            .map_err(|e| Tx0Error::VerificationFailed(format!("fee-proof push: {}", e)))?;
        outputs.push(TxOut {
            value: 0,
            script_pubkey: ScriptBuf::new_op_return(&push),
        });

        bip69::sort_outputs(&mut outputs);

        let spend_from = &self.spend_froms[0];
        let mut tx = Transaction {
            version: TX0_VERSION,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: spend_from.outpoint(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: outputs,
        };

        let witness = sign_p2wpkh_input(self.service, &tx, 0, spend_from.value, secret_key)?;
        tx.input[0].witness = witness;

        let txid = tx.txid();
        let premix_outputs = tx
            .output
            .iter()
            .enumerate()
            .filter(|(_, output)| premix_scripts.contains(&output.script_pubkey))
            .map(|(index, _)| OutPoint::new(txid, index as u32))
            .collect();

        Ok((tx, premix_outputs))
    }
}

/// Fee amount moved by the fee output, rejecting a non-positive one
fn fee_amount(tx0_data: &Tx0Data) -> Result<u64, Tx0Error> {
    let raw = if tx0_data.fee_value > 0 {
        tx0_data.fee_value
    } else {
        tx0_data.fee_change
    };
    let amount = raw.max(0) as u64;
    if amount == 0 {
        return Err(Tx0Error::InvalidTx0Data(format!(
            "fee amount should be > 0 (feeValue={}, feeChange={})",
            tx0_data.fee_value, tx0_data.fee_change
        )));
    }
    Ok(amount)
}

fn p2wpkh_script_code(public_key: &PublicKey) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&public_key.pubkey_hash())
}

fn segwit_message(
    tx: &Transaction,
    input_index: usize,
    script_code: &ScriptBuf,
    value: u64,
) -> Result<Message, Tx0Error> {
    let sighash = SighashCache::new(tx)
        .segwit_signature_hash(input_index, script_code, value, EcdsaSighashType::All)
        .map_err(|e| Tx0Error::Signing(e.to_string()))?;
    Message::from_slice(sighash.as_byte_array()).map_err(|e| Tx0Error::Signing(e.to_string()))
}

fn sign_p2wpkh_input(
    service: &Tx0Service,
    tx: &Transaction,
    input_index: usize,
    value: u64,
    secret_key: &SecretKey,
) -> Result<Witness, Tx0Error> {
    let public_key = PublicKey::new(SecpPublicKey::from_secret_key(service.secp(), secret_key));
    let script_code = p2wpkh_script_code(&public_key);
    let message = segwit_message(tx, input_index, &script_code, value)?;

    let signature = bitcoin::ecdsa::Signature {
        sig: service.secp().sign_ecdsa(&message, secret_key),
        hash_ty: EcdsaSighashType::All,
    };

    Ok(Witness::from_slice(&[
        signature.to_vec(),
        public_key.to_bytes(),
    ]))
}

/// Structural checks on a signed Tx0
///
/// Values must balance to the expected miner fee, exactly one fee-proof output
/// of the fixed length must be present and every input witness must verify.
fn verify_tx0(
    service: &Tx0Service,
    tx: &Transaction,
    spend_froms: &[UnspentOutput],
    miner_fee: u64,
) -> Result<(), Tx0Error> {
    if tx.input.is_empty() || tx.output.is_empty() {
        return Err(Tx0Error::VerificationFailed(
            "transaction has no inputs or no outputs".to_string(),
        ));
    }
    if tx.input.len() != spend_froms.len() {
        return Err(Tx0Error::VerificationFailed(format!(
            "{} inputs for {} spendFroms",
            tx.input.len(),
            spend_froms.len()
        )));
    }

    let total_in: u64 = spend_froms.iter().map(|utxo| utxo.value).sum();
    let total_out: u64 = tx.output.iter().map(|output| output.value).sum();
    if total_out.checked_add(miner_fee) != Some(total_in) {
        return Err(Tx0Error::VerificationFailed(format!(
            "values do not balance: in={}, out={}, minerFee={}",
            total_in, total_out, miner_fee
        )));
    }

    let op_returns: Vec<&TxOut> = tx
        .output
        .iter()
        .filter(|output| output.script_pubkey.is_op_return())
        .collect();
    if op_returns.len() != 1 {
        return Err(Tx0Error::VerificationFailed(format!(
            "expected one fee-proof output, got {}",
            op_returns.len()
        )));
    }
    // OP_RETURN, OP_PUSHBYTES_64, data
    let op_return_len = op_returns[0].script_pubkey.len();
    if op_return_len != FEE_PROOF_LENGTH + 2 || op_returns[0].value != 0 {
        return Err(Tx0Error::InvalidFeeProofLength {
            expected: FEE_PROOF_LENGTH,
            actual: op_return_len.saturating_sub(2),
        });
    }

    for (index, (input, spend_from)) in tx.input.iter().zip(spend_froms).enumerate() {
        if input.previous_output != spend_from.outpoint() {
            return Err(Tx0Error::VerificationFailed(format!(
                "input {} does not spend {}",
                index,
                spend_from.key()
            )));
        }
        let (signature, public_key) = match (input.witness.nth(0), input.witness.nth(1)) {
            (Some(signature), Some(public_key)) if input.witness.len() == 2 => {
                (signature, public_key)
            }
            _ => {
                return Err(Tx0Error::VerificationFailed(format!(
                    "input {} has no P2WPKH witness",
                    index
                )))
            }
        };

        let signature = bitcoin::ecdsa::Signature::from_slice(signature)
            .map_err(|e| Tx0Error::VerificationFailed(format!("input {}: {}", index, e)))?;
        let public_key = PublicKey::from_slice(public_key)
            .map_err(|e| Tx0Error::VerificationFailed(format!("input {}: {}", index, e)))?;

        let script_code = p2wpkh_script_code(&public_key);
        let message = segwit_message(tx, index, &script_code, spend_from.value)?;
        service
            .secp()
            .verify_ecdsa(&message, &signature.sig, &public_key.inner)
            .map_err(|e| Tx0Error::VerificationFailed(format!("input {}: {}", index, e)))?;
    }

    Ok(())
}
