//! Which pools can a UTXO enter
//!
//! Candidate pools are filtered, never re-ranked: the caller's order is the
//! preference order and the first eligible pool is the best one.

use crate::error::Tx0Error;
use crate::fee_economics::FeeEconomics;
use crate::types::Pool;

#[derive(Debug, Clone, Default)]
pub struct PoolSelector {
    economics: FeeEconomics,
}

impl PoolSelector {
    pub fn new(economics: FeeEconomics) -> Self {
        Self { economics }
    }

    /// True when `utxo_value` funds at least `nb_outputs_min` premix outputs
    pub fn is_tx0_possible(
        &self,
        utxo_value: u64,
        pool: &Pool,
        fee_tx0: u64,
        fee_premix: u64,
        nb_outputs_min: u32,
    ) -> bool {
        let balance_min =
            self.economics
                .compute_spend_from_balance_min(pool, fee_tx0, fee_premix, nb_outputs_min);
        utxo_value >= balance_min
    }

    /// Eligible pools, in the order given
    pub fn find_pools<'p>(
        &self,
        nb_outputs_min: u32,
        pools_by_preference: &'p [Pool],
        utxo_value: u64,
        fee_tx0: u64,
        fee_premix: u64,
    ) -> Vec<&'p Pool> {
        pools_by_preference
            .iter()
            .filter(|pool| {
                self.is_tx0_possible(utxo_value, pool, fee_tx0, fee_premix, nb_outputs_min)
            })
            .collect()
    }

    /// First eligible pool
    pub fn find_best_pool<'p>(
        &self,
        nb_outputs_min: u32,
        pools_by_preference: &'p [Pool],
        utxo_value: u64,
        fee_tx0: u64,
        fee_premix: u64,
    ) -> Result<&'p Pool, Tx0Error> {
        pools_by_preference
            .iter()
            .find(|pool| {
                self.is_tx0_possible(utxo_value, pool, fee_tx0, fee_premix, nb_outputs_min)
            })
            .ok_or(Tx0Error::NoEligiblePool {
                utxo_value,
                nb_outputs_min,
            })
    }
}
