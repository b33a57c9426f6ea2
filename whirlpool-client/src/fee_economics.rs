//! Fee and denomination arithmetic shared by the Tx0 builder and pool selection
//!
//! All amounts are satoshis and all fee rates are sat/vB. Everything here is a
//! pure function of its inputs; the only injected piece is the byte-size
//! estimator.
//!
//! Example:
//! ```
//! use whirlpool_client::fee_economics::FeeEconomics;
//! use whirlpool_client::types::Pool;
//!
//! let economics = FeeEconomics::default();
//! let pool = Pool::new_with_defaults("0.5btc", 50_000_000, 500_000, 5, 5);
//!
//! let premix_value = economics.compute_premix_value(&pool, 10);
//! assert!(premix_value > pool.denomination);
//! ```

use std::fmt;
use std::sync::Arc;

use log::debug;

use crate::types::Pool;

/// Virtual size of a P2WPKH input
pub const P2WPKH_INPUT_VSIZE: u64 = 68;
/// Virtual size of a P2WPKH output
pub const P2WPKH_OUTPUT_VSIZE: u64 = 31;
/// Virtual size of the fee-proof OP_RETURN output
pub const OP_RETURN_OUTPUT_VSIZE: u64 = 75;
/// Version, locktime, counts and segwit marker
pub const TX_OVERHEAD_VSIZE: u64 = 11;

/// Estimates the virtual size of a transaction from its shape
pub trait TxSizeEstimator: Send + Sync {
    /// Virtual bytes of a transaction spending `nb_inputs` P2WPKH inputs into
    /// `nb_outputs` P2WPKH outputs plus `nb_op_returns` data outputs
    fn estimate_vsize(&self, nb_inputs: u64, nb_outputs: u64, nb_op_returns: u64) -> u64;

    fn estimate_fee(
        &self,
        nb_inputs: u64,
        nb_outputs: u64,
        nb_op_returns: u64,
        fee_per_byte: u64,
    ) -> u64 {
        self.estimate_vsize(nb_inputs, nb_outputs, nb_op_returns) * fee_per_byte
    }
}

/// Native segwit size model: fixed per-input and per-output weights
#[derive(Debug, Clone, Copy, Default)]
pub struct SegwitSizeEstimator;

impl TxSizeEstimator for SegwitSizeEstimator {
    fn estimate_vsize(&self, nb_inputs: u64, nb_outputs: u64, nb_op_returns: u64) -> u64 {
        TX_OVERHEAD_VSIZE
            + nb_inputs * P2WPKH_INPUT_VSIZE
            + nb_outputs * P2WPKH_OUTPUT_VSIZE
            + nb_op_returns * OP_RETURN_OUTPUT_VSIZE
    }
}

/// Premix denomination, Tx0 miner fee and minimum balance computations
#[derive(Clone)]
pub struct FeeEconomics {
    estimator: Arc<dyn TxSizeEstimator>,
}

impl fmt::Debug for FeeEconomics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeeEconomics").finish_non_exhaustive()
    }
}

impl Default for FeeEconomics {
    fn default() -> Self {
        Self::new(Arc::new(SegwitSizeEstimator))
    }
}

impl FeeEconomics {
    pub fn new(estimator: Arc<dyn TxSizeEstimator>) -> Self {
        Self { estimator }
    }

    pub fn estimator(&self) -> &dyn TxSizeEstimator {
        self.estimator.as_ref()
    }

    /// Premix output value for `pool` at the mix fee rate `fee_premix`
    ///
    /// The miner fee of a full mix round is split across the pool's
    /// `min_must_mix` participants and added to the denomination, then the
    /// result is bounded from above by max and cap and from below by min. The
    /// floor is applied last, so a pool whose min exceeds its cap yields min.
    pub fn compute_premix_value(&self, pool: &Pool, fee_premix: u64) -> u64 {
        let anonset = u64::from(pool.mix_anonymity_set);
        let mix_fees_estimate = self.estimator.estimate_fee(anonset, anonset, 0, fee_premix);
        let miner_fee_per_must_mix = mix_fees_estimate / u64::from(pool.min_must_mix.max(1));
        let premix_value = pool.denomination + miner_fee_per_must_mix;

        let premix_value_final = premix_value
            .min(pool.premix_balance_max)
            .min(pool.premix_balance_cap)
            .max(pool.premix_balance_min);

        debug!(
            "premixValueFinal={}, premixValue={}, minerFeePerMustmix={}, txPremixFeesEstimate={} for poolId={}",
            premix_value_final,
            premix_value,
            miner_fee_per_must_mix,
            mix_fees_estimate,
            pool.pool_id
        );
        premix_value_final
    }

    /// Miner fee of a Tx0 with `nb_premix` premix outputs
    ///
    /// Sized for premix + change + fee outputs, one fee-proof output and
    /// `max(1, nb_spend_froms)` inputs.
    pub fn compute_tx0_miner_fee(
        &self,
        nb_premix: u32,
        fee_tx0: u64,
        nb_spend_froms: usize,
    ) -> u64 {
        let nb_outputs_non_op_return = u64::from(nb_premix) + 2;
        let nb_inputs = nb_spend_froms.max(1) as u64;
        let tx0_miner_fee =
            self.estimator.estimate_fee(nb_inputs, nb_outputs_non_op_return, 1, fee_tx0);

        debug!(
            "tx0 minerFee: {}sats for nbPremix={}, feeTx0={}",
            tx0_miner_fee, nb_premix, fee_tx0
        );
        tx0_miner_fee
    }

    /// Total value leaving the funding inputs for a Tx0
    pub fn compute_tx0_spend_value(
        premix_value: u64,
        nb_premix: u32,
        pool_fee: u64,
        tx0_miner_fee: u64,
    ) -> u64 {
        premix_value
            .saturating_mul(u64::from(nb_premix))
            .saturating_add(pool_fee)
            .saturating_add(tx0_miner_fee)
    }

    /// Minimum funding balance that yields `nb_premix` premix outputs in `pool`
    pub fn compute_spend_from_balance_min(
        &self,
        pool: &Pool,
        fee_tx0: u64,
        fee_premix: u64,
        nb_premix: u32,
    ) -> u64 {
        let premix_value = self.compute_premix_value(pool, fee_premix);
        let tx0_miner_fee = self.compute_tx0_miner_fee(nb_premix, fee_tx0, 1);
        Self::compute_tx0_spend_value(premix_value, nb_premix, pool.fee_value, tx0_miner_fee)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segwit_vsize_counts_every_part() {
        let estimator = SegwitSizeEstimator;
        assert_eq!(estimator.estimate_vsize(0, 0, 0), TX_OVERHEAD_VSIZE);
        assert_eq!(estimator.estimate_vsize(1, 7, 1), 11 + 68 + 7 * 31 + 75);
        assert_eq!(estimator.estimate_fee(1, 7, 1, 10), 3710);
    }
}
