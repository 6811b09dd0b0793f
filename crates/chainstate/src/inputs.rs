//! Input checks shared by block connection and mempool admission.

use stakd_consensus::money::money_range;
use stakd_primitives::transaction::{Transaction, TxOut};
use stakd_script::{ScriptFlags, ScriptVerifier, MANDATORY_SCRIPT_VERIFY_FLAGS};

use crate::coins::{Coin, CoinsView};
use crate::validation::{ValidationError, REJECT_INVALID, REJECT_NONSTANDARD};

#[derive(Clone, Debug)]
pub struct SpentInputs {
    pub coins: Vec<Coin>,
    pub value_in: i64,
    /// Inputs minus outputs; a coinstake may mint and reports zero.
    pub fee: i64,
}

impl SpentInputs {
    pub fn outputs(&self) -> Vec<TxOut> {
        self.coins.iter().map(Coin::output).collect()
    }
}

/// Resolves every input of a non-coinbase `tx` and checks maturity and value ranges.
///
/// `spend_height` is the height of the block the transaction would be included in.
pub fn check_tx_inputs(
    tx: &Transaction,
    view: &dyn CoinsView,
    spend_height: i32,
    coinbase_maturity: i32,
) -> Result<SpentInputs, ValidationError> {
    let mut coins = Vec::with_capacity(tx.vin.len());
    let mut value_in = 0i64;
    for input in &tx.vin {
        let coin = view
            .coin(&input.prevout)
            .map_err(|err| ValidationError::Corruption(err.to_string()))?
            .ok_or_else(|| {
                ValidationError::dos(
                    100,
                    REJECT_INVALID,
                    "bad-txns-inputs-missingorspent",
                    "inputs missing or already spent",
                )
            })?;
        if coin.is_reward() && spend_height - coin.height < coinbase_maturity {
            return Err(ValidationError::invalid(
                REJECT_INVALID,
                "bad-txns-premature-spend-of-coinbase",
                format!(
                    "tried to spend coinbase at depth {}",
                    spend_height - coin.height
                ),
            ));
        }
        value_in = value_in.saturating_add(coin.value);
        if !money_range(coin.value) || !money_range(value_in) {
            return Err(ValidationError::dos(
                100,
                REJECT_INVALID,
                "bad-txns-inputvalues-outofrange",
                "input values out of range",
            ));
        }
        coins.push(coin);
    }

    let value_out = tx.value_out().unwrap_or(i64::MAX);
    let fee = if tx.is_coinstake() {
        0
    } else {
        if value_in < value_out {
            return Err(ValidationError::dos(
                100,
                REJECT_INVALID,
                "bad-txns-in-belowout",
                format!("value in ({value_in}) < value out ({value_out})"),
            ));
        }
        let fee = value_in - value_out;
        if fee < 0 {
            return Err(ValidationError::dos(
                100,
                REJECT_INVALID,
                "bad-txns-fee-negative",
                "fee is negative",
            ));
        }
        if !money_range(fee) {
            return Err(ValidationError::dos(
                100,
                REJECT_INVALID,
                "bad-txns-fee-outofrange",
                "fee out of range",
            ));
        }
        fee
    };
    Ok(SpentInputs {
        coins,
        value_in,
        fee,
    })
}

/// Runs every input script under `flags`.
///
/// A failure that disappears under the mandatory flags alone is a policy rejection
/// without penalty; anything else is a consensus failure.
pub fn check_input_scripts(
    verifier: &dyn ScriptVerifier,
    tx: &Transaction,
    spent: &[TxOut],
    flags: ScriptFlags,
) -> Result<(), ValidationError> {
    let Err((index, err)) = verifier.verify_inputs(tx, spent, flags) else {
        return Ok(());
    };
    if flags != MANDATORY_SCRIPT_VERIFY_FLAGS {
        if let Some(prev) = spent.get(index) {
            if verifier
                .verify_input(tx, index, prev, MANDATORY_SCRIPT_VERIFY_FLAGS)
                .is_ok()
            {
                return Err(ValidationError::invalid(
                    REJECT_NONSTANDARD,
                    format!("non-mandatory-script-verify-flag ({err})"),
                    format!("input {index}"),
                ));
            }
        }
    }
    Err(ValidationError::dos(
        100,
        REJECT_INVALID,
        format!("mandatory-script-verify-flag-failed ({err})"),
        format!("input {index}"),
    ))
}
