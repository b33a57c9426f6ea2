//! Maximum affordable number of premix outputs

use log::debug;

use crate::fee_economics::FeeEconomics;
use crate::types::NB_PREMIX_MAX;

/// Largest `nb_premix` such that
/// `nb_premix * premix_value + pool_fee + tx0_miner_fee(nb_premix) <= balance`
///
/// Starts from the fee-naive bound `ceil(balance / premix_value)` and walks
/// down one output at a time. The miner fee is strictly increasing in the
/// number of outputs, so the first affordable count is the maximum.
pub fn compute_nb_premix_max(
    economics: &FeeEconomics,
    premix_value: u64,
    spend_from_balance: u64,
    pool_fee: u64,
    fee_tx0: u64,
    nb_spend_froms: usize,
) -> u32 {
    if premix_value == 0 {
        return 0;
    }

    let nb_premix_initial =
        spend_from_balance / premix_value + u64::from(spend_from_balance % premix_value != 0);
    let mut nb_premix = u32::try_from(nb_premix_initial).unwrap_or(u32::MAX);

    loop {
        let tx0_miner_fee = economics.compute_tx0_miner_fee(nb_premix, fee_tx0, nb_spend_froms);
        let spend_value =
            FeeEconomics::compute_tx0_spend_value(premix_value, nb_premix, pool_fee, tx0_miner_fee);
        debug!(
            "computeNbPremixMax: nbPremix={} => spendValue={}, tx0MinerFee={}, spendFromBalance={}, nbPremixInitial={}",
            nb_premix, spend_value, tx0_miner_fee, spend_from_balance, nb_premix_initial
        );

        if spend_value <= spend_from_balance || nb_premix == 0 {
            break;
        }
        nb_premix -= 1;
    }

    nb_premix
}

/// Apply the caller cap and the protocol ceiling
pub fn cap_nb_premix(nb_premix: u32, max_outputs: Option<u32>) -> u32 {
    let capped = match max_outputs {
        Some(max_outputs) => nb_premix.min(max_outputs),
        None => nb_premix,
    };
    capped.min(NB_PREMIX_MAX)
}
