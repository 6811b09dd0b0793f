//! Relay standardness: the policy layer applied on top of the consensus rules
//! before a loose transaction is admitted.

use stakd_chainstate::validation::is_final_tx;
use stakd_consensus::constants::{
    CURRENT_TX_VERSION, MAX_OP_META_RELAY, MAX_P2SH_SIGOPS, MAX_STANDARD_TX_SIGOPS,
    MAX_STANDARD_TX_SIZE,
};
use stakd_consensus::ChainParams;
use stakd_primitives::encoding::varint_len;
use stakd_primitives::transaction::{Transaction, TxOut};
use stakd_script::interpreter::SCRIPT_VERIFY_NONE;
use stakd_script::standard::{args_expected, is_standard_script_pubkey};
use stakd_script::{count_sigops, eval_push_only, is_push_only, solver, TxOutType};

use crate::fees::min_relay_fee_for_size;

pub const DEFAULT_MIN_RELAY_TX_FEE: i64 = 10_000;
pub const DEFAULT_LIMIT_FREE_RELAY: u64 = 30;
pub const DEFAULT_MAX_ORPHAN_TRANSACTIONS: usize = 100;
/// A 15-of-15 P2SH multisig spend with compressed keys, rounded up.
pub const MAX_STANDARD_SCRIPTSIG_SIZE: usize = 1650;
/// Bytes of the input that will later spend an output, used for the dust threshold.
const SPEND_INPUT_SIZE: usize = 148;

#[derive(Clone, Debug, PartialEq)]
pub struct MempoolPolicy {
    pub require_standard: bool,
    /// Fee rate per 1000 bytes.
    pub min_relay_fee_per_kb: i64,
    /// Thousands of bytes per minute.
    pub limit_free_relay_kb_per_minute: u64,
    /// Free transactions must also carry enough coin-age priority.
    pub relay_priority: bool,
    /// Largest relayed `OP_META` output script; `None` rejects them.
    pub max_datacarrier_bytes: Option<usize>,
    pub permit_bare_multisig: bool,
    pub max_scriptsig_size: usize,
    pub max_standard_tx_sigops: u32,
    pub max_orphans: usize,
}

impl MempoolPolicy {
    pub fn standard(min_relay_fee_per_kb: i64, require_standard: bool) -> Self {
        Self {
            require_standard,
            min_relay_fee_per_kb: min_relay_fee_per_kb.max(0),
            limit_free_relay_kb_per_minute: DEFAULT_LIMIT_FREE_RELAY,
            relay_priority: true,
            max_datacarrier_bytes: Some(MAX_OP_META_RELAY),
            permit_bare_multisig: true,
            max_scriptsig_size: MAX_STANDARD_SCRIPTSIG_SIZE,
            max_standard_tx_sigops: MAX_STANDARD_TX_SIGOPS,
            max_orphans: DEFAULT_MAX_ORPHAN_TRANSACTIONS,
        }
    }

    pub fn for_params(params: &ChainParams) -> Self {
        Self::standard(DEFAULT_MIN_RELAY_TX_FEE, params.require_standard)
    }

    pub fn min_relay_fee_for_size(&self, size: usize) -> i64 {
        min_relay_fee_for_size(self.min_relay_fee_per_kb, size)
    }

    /// Outputs worth less than three times the fee needed to spend them.
    pub fn is_dust(&self, output: &TxOut) -> bool {
        let script_len = output.script_pubkey.len();
        let output_size = 8 + varint_len(script_len as u64) + script_len;
        let spend_fee = self.min_relay_fee_for_size(output_size + SPEND_INPUT_SIZE);
        output.value < spend_fee.saturating_mul(3)
    }
}

/// Checks the transaction's own shape against relay policy. `next_height` is the
/// height of the block it could be mined in; `adjusted_time` the network time.
///
/// Returns the reject reason on failure.
pub fn is_standard_tx(
    tx: &Transaction,
    policy: &MempoolPolicy,
    next_height: i32,
    adjusted_time: i64,
) -> Result<(), &'static str> {
    if tx.version > CURRENT_TX_VERSION || tx.version < 1 {
        return Err("version");
    }
    if !is_final_tx(tx, next_height, adjusted_time) {
        return Err("non-final");
    }
    if tx.serialized_size() >= MAX_STANDARD_TX_SIZE as usize {
        return Err("tx-size");
    }

    for input in &tx.vin {
        if input.script_sig.len() > policy.max_scriptsig_size {
            return Err("scriptsig-size");
        }
        if !is_push_only(&input.script_sig) {
            return Err("scriptsig-not-pushonly");
        }
    }

    let mut data_outputs = 0usize;
    for output in &tx.vout {
        let Some(kind) =
            is_standard_script_pubkey(&output.script_pubkey, policy.max_datacarrier_bytes)
        else {
            return Err("scriptpubkey");
        };
        match kind {
            TxOutType::NullData => data_outputs += 1,
            TxOutType::Multisig if !policy.permit_bare_multisig => return Err("bare-multisig"),
            _ if policy.is_dust(output) => return Err("dust"),
            _ => {}
        }
    }
    if data_outputs > 1 {
        return Err("multi-op-meta");
    }
    Ok(())
}

/// Stack-shape checks of each scriptSig against the template of the output it
/// spends. `spent[i]` is the output spent by `tx.vin[i]`.
pub fn are_inputs_standard(tx: &Transaction, spent: &[TxOut]) -> bool {
    if tx.is_coinbase() {
        return true;
    }
    if spent.len() != tx.vin.len() {
        return false;
    }
    for (input, prev) in tx.vin.iter().zip(spent) {
        let (kind, solutions) = solver(&prev.script_pubkey);
        let Some(mut expected) = args_expected(kind, &solutions) else {
            return false;
        };
        let Ok(stack) = eval_push_only(&input.script_sig, SCRIPT_VERIFY_NONE) else {
            return false;
        };

        match kind {
            TxOutType::Vault => {
                // the last item selects the spending path: empty or 0x01
                let Some(marker) = stack.last() else {
                    return false;
                };
                if marker.len() > 1 || (marker.len() == 1 && marker[0] != 0x01) {
                    return false;
                }
            }
            TxOutType::ScriptHash => {
                let Some(redeem) = stack.last() else {
                    return false;
                };
                let (inner_kind, inner_solutions) = solver(redeem);
                if inner_kind == TxOutType::NonStandard {
                    if count_sigops(redeem, true) > MAX_P2SH_SIGOPS {
                        return false;
                    }
                    continue;
                }
                let Some(inner_expected) = args_expected(inner_kind, &inner_solutions) else {
                    return false;
                };
                expected += inner_expected;
            }
            _ => {}
        }

        if stack.len() != expected {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use stakd_consensus::money::COIN;
    use stakd_primitives::outpoint::OutPoint;
    use stakd_primitives::transaction::TxIn;
    use stakd_script::opcodes::{OP_CHECKSIG, OP_DUP, OP_EQUAL};
    use stakd_script::standard::{
        multisig_script, null_data_script, p2pkh_script, p2sh_script, vault_script,
    };

    fn policy() -> MempoolPolicy {
        MempoolPolicy::standard(DEFAULT_MIN_RELAY_TX_FEE, true)
    }

    fn push(data: &[u8]) -> Vec<u8> {
        let mut script = vec![data.len() as u8];
        script.extend_from_slice(data);
        script
    }

    fn tx_paying(outputs: Vec<TxOut>) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn::new(
                OutPoint::new([3u8; 32], 0),
                [push(&[0x30; 71]), push(&[0x02; 33])].concat(),
            )],
            vout: outputs,
            lock_time: 0,
        }
    }

    #[test]
    fn dust_threshold_tracks_relay_fee() {
        let policy = policy();
        let script = p2pkh_script(&[7u8; 20]);
        // 34 byte output + 148 byte spend at 10 per byte, times three
        assert!(policy.is_dust(&TxOut::new(5_459, script.clone())));
        assert!(!policy.is_dust(&TxOut::new(5_460, script)));
    }

    #[test]
    fn standard_payment_passes() {
        let tx = tx_paying(vec![TxOut::new(COIN, p2pkh_script(&[1u8; 20]))]);
        assert_eq!(is_standard_tx(&tx, &policy(), 10, 0), Ok(()));
    }

    #[test]
    fn shape_rejections_report_reasons() {
        let policy = policy();
        let mut tx = tx_paying(vec![TxOut::new(COIN, p2pkh_script(&[1u8; 20]))]);
        tx.version = 3;
        assert_eq!(is_standard_tx(&tx, &policy, 10, 0), Err("version"));

        let mut tx = tx_paying(vec![TxOut::new(COIN, p2pkh_script(&[1u8; 20]))]);
        tx.lock_time = 50;
        tx.vin[0].sequence = 0;
        assert_eq!(is_standard_tx(&tx, &policy, 10, 0), Err("non-final"));

        let mut tx = tx_paying(vec![TxOut::new(COIN, p2pkh_script(&[1u8; 20]))]);
        tx.vin[0].script_sig.push(OP_CHECKSIG);
        assert_eq!(is_standard_tx(&tx, &policy, 10, 0), Err("scriptsig-not-pushonly"));

        let tx = tx_paying(vec![TxOut::new(COIN, vec![OP_EQUAL])]);
        assert_eq!(is_standard_tx(&tx, &policy, 10, 0), Err("scriptpubkey"));

        let tx = tx_paying(vec![TxOut::new(100, p2pkh_script(&[1u8; 20]))]);
        assert_eq!(is_standard_tx(&tx, &policy, 10, 0), Err("dust"));

        let tx = tx_paying(vec![
            TxOut::new(0, null_data_script(b"one")),
            TxOut::new(0, null_data_script(b"two")),
        ]);
        assert_eq!(is_standard_tx(&tx, &policy, 10, 0), Err("multi-op-meta"));
    }

    #[test]
    fn datacarrier_limit_applies_to_meta_outputs() {
        let mut policy = policy();
        let tx = tx_paying(vec![TxOut::new(0, null_data_script(&[9u8; 40]))]);
        assert_eq!(is_standard_tx(&tx, &policy, 10, 0), Ok(()));
        policy.max_datacarrier_bytes = Some(20);
        assert_eq!(is_standard_tx(&tx, &policy, 10, 0), Err("scriptpubkey"));
        policy.max_datacarrier_bytes = None;
        assert_eq!(is_standard_tx(&tx, &policy, 10, 0), Err("scriptpubkey"));
    }

    #[test]
    fn bare_multisig_can_be_refused() {
        let mut policy = policy();
        let keys = vec![vec![0x02; 33], vec![0x03; 33]];
        let tx = tx_paying(vec![TxOut::new(COIN, multisig_script(1, &keys))]);
        assert_eq!(is_standard_tx(&tx, &policy, 10, 0), Ok(()));
        policy.permit_bare_multisig = false;
        assert_eq!(is_standard_tx(&tx, &policy, 10, 0), Err("bare-multisig"));
    }

    #[test]
    fn input_stack_must_match_template() {
        let tx = tx_paying(vec![TxOut::new(COIN, p2pkh_script(&[1u8; 20]))]);
        let p2pkh = TxOut::new(COIN, p2pkh_script(&[1u8; 20]));
        assert!(are_inputs_standard(&tx, &[p2pkh.clone()]));

        let mut extra = tx.clone();
        extra.vin[0].script_sig.extend_from_slice(&push(&[1]));
        assert!(!are_inputs_standard(&extra, &[p2pkh]));

        let nonstandard = TxOut::new(COIN, vec![OP_EQUAL]);
        assert!(!are_inputs_standard(&tx, &[nonstandard]));
    }

    #[test]
    fn vault_spend_needs_path_marker() {
        let vault = TxOut::new(COIN, vault_script(&[1u8; 20], &[2u8; 20]));
        let with_marker = |marker: &[u8]| {
            let mut tx = tx_paying(vec![TxOut::new(COIN, p2pkh_script(&[1u8; 20]))]);
            tx.vin[0].script_sig.extend_from_slice(&push(marker));
            tx
        };
        assert!(are_inputs_standard(&with_marker(&[0x01]), &[vault.clone()]));
        assert!(are_inputs_standard(&with_marker(&[]), &[vault.clone()]));
        assert!(!are_inputs_standard(&with_marker(&[0x02]), &[vault.clone()]));
        assert!(!are_inputs_standard(&with_marker(&[0x01, 0x01]), &[vault]));
    }

    #[test]
    fn p2sh_redeem_script_is_counted() {
        let redeem = p2pkh_script(&[5u8; 20]);
        let hash = stakd_primitives::hash::hash160(&redeem);
        let spent = TxOut::new(COIN, p2sh_script(&hash));
        let mut tx = tx_paying(vec![TxOut::new(COIN, p2pkh_script(&[1u8; 20]))]);
        tx.vin[0].script_sig.push(redeem.len() as u8);
        tx.vin[0].script_sig.extend_from_slice(&redeem);
        assert!(are_inputs_standard(&tx, &[spent.clone()]));

        // a redeem script of plain opcodes is allowed with any leftover stack
        let arbitrary = vec![OP_DUP, OP_EQUAL];
        let arbitrary_spent = TxOut::new(
            COIN,
            p2sh_script(&stakd_primitives::hash::hash160(&arbitrary)),
        );
        let mut loose = tx_paying(vec![TxOut::new(COIN, p2pkh_script(&[1u8; 20]))]);
        loose.vin[0].script_sig.extend_from_slice(&push(&arbitrary));
        assert!(are_inputs_standard(&loose, &[arbitrary_spent]));

        let mut short = tx_paying(vec![TxOut::new(COIN, p2pkh_script(&[1u8; 20]))]);
        short.vin[0].script_sig = push(&redeem);
        assert!(!are_inputs_standard(&short, &[spent]));
    }
}
