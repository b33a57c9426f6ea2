//! Ordering of queued UTXOs

use std::cmp::Ordering;

use crate::types::WhirlpoolUtxo;

/// Total order over queued UTXOs; `Ordering::Less` mixes first
pub trait UtxoPriority: Send + Sync {
    fn compare(&self, a: &WhirlpoolUtxo, b: &WhirlpoolUtxo) -> Ordering;
}

/// Fewer mixes done first, then larger value, then longest waiting.
/// The UTXO key breaks remaining ties so the order is total.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultUtxoPriority;

impl UtxoPriority for DefaultUtxoPriority {
    fn compare(&self, a: &WhirlpoolUtxo, b: &WhirlpoolUtxo) -> Ordering {
        a.mixs_done
            .cmp(&b.mixs_done)
            .then_with(|| b.utxo.value.cmp(&a.utxo.value))
            .then_with(|| a.last_activity.cmp(&b.last_activity))
            .then_with(|| a.key().cmp(&b.key()))
    }
}

impl<F> UtxoPriority for F
where
    F: Fn(&WhirlpoolUtxo, &WhirlpoolUtxo) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &WhirlpoolUtxo, b: &WhirlpoolUtxo) -> Ordering {
        self(a, b)
    }
}
