//! BIP69 lexicographic output ordering

use std::cmp::Ordering;

use bitcoin::TxOut;

/// Ascending value, ties broken by ascending scriptPubKey bytes
pub fn compare_outputs(a: &TxOut, b: &TxOut) -> Ordering {
    match a.value.cmp(&b.value) {
        Ordering::Equal => a.script_pubkey.as_bytes().cmp(b.script_pubkey.as_bytes()),
        other => other,
    }
}

/// Sort outputs in place
pub fn sort_outputs(outputs: &mut [TxOut]) {
    outputs.sort_by(compare_outputs);
}
