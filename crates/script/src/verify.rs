//! Script verification seam used by block connection and mempool admission.

use stakd_primitives::transaction::{Transaction, TxOut};

use crate::interpreter::{verify_script, ScriptError, ScriptFlags};

pub trait ScriptVerifier: Send + Sync {
    /// Verifies input `input_index` of `tx` against the output it spends.
    fn verify_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        spent: &TxOut,
        flags: ScriptFlags,
    ) -> Result<(), ScriptError>;

    /// Verifies every input; `spent[i]` is the output spent by `tx.vin[i]`.
    fn verify_inputs(
        &self,
        tx: &Transaction,
        spent: &[TxOut],
        flags: ScriptFlags,
    ) -> Result<(), (usize, ScriptError)> {
        if spent.len() != tx.vin.len() {
            return Err((spent.len().min(tx.vin.len()), ScriptError::InputIndexOutOfRange));
        }
        for (index, prev) in spent.iter().enumerate() {
            self.verify_input(tx, index, prev, flags)
                .map_err(|err| (index, err))?;
        }
        Ok(())
    }
}

/// Verifies spends of the standard templates with secp256k1 signatures.
#[derive(Clone, Copy, Debug, Default)]
pub struct TemplateVerifier;

impl ScriptVerifier for TemplateVerifier {
    fn verify_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        spent: &TxOut,
        flags: ScriptFlags,
    ) -> Result<(), ScriptError> {
        let input = tx
            .vin
            .get(input_index)
            .ok_or(ScriptError::InputIndexOutOfRange)?;
        verify_script(&input.script_sig, &spent.script_pubkey, tx, input_index, flags)
    }
}
