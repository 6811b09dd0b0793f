//! Applying and reverting blocks against the coin set.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rayon::prelude::*;
use stakd_consensus::constants::MAX_BLOCK_SIGOPS;
use stakd_consensus::{hash256_to_hex, ChainParams, Hash256};
use stakd_primitives::block::Block;
use stakd_primitives::outpoint::OutPoint;
use stakd_primitives::transaction::TxOut;
use stakd_script::interpreter::BLOCK_SCRIPT_VERIFY_FLAGS;
use stakd_script::{p2sh_sigops, ScriptVerifier};
use stakd_storage::{Column, KeyValueStore, WriteBatch};

use crate::blockindex::BlockIndexNode;
use crate::coins::{Coin, CoinsError, CoinsView, UtxoSet};
use crate::inputs::check_tx_inputs;
use crate::undo::{BlockUndo, SpentCoin};
use crate::validation::{legacy_sigop_count, ValidationError, REJECT_INVALID};

/// Moves the coin set one block forward or back.
///
/// Errors are `Invalid` when the block breaks a rule and `Corruption` when the
/// store or undo data fails.
pub trait ChainTipManager: Send + Sync {
    fn connect_tip(&mut self, node: &BlockIndexNode, block: &Block) -> Result<(), ValidationError>;
    fn disconnect_tip(&mut self, node: &BlockIndexNode, block: &Block)
        -> Result<(), ValidationError>;
    /// Coins as of the current tip.
    fn coins(&self) -> &dyn CoinsView;
    /// Hash of the block the coin set reflects.
    fn best_block(&self) -> Result<Option<Hash256>, ValidationError>;
}

struct ScriptCheck {
    tx_index: usize,
    input_index: usize,
    spent: TxOut,
}

/// Block-local coin changes layered over the stored set, so later transactions can
/// spend earlier ones in the same block.
struct BlockCoinsOverlay<'a> {
    base: &'a dyn CoinsView,
    added: HashMap<OutPoint, Coin>,
    spent: HashSet<OutPoint>,
}

impl CoinsView for BlockCoinsOverlay<'_> {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        if self.spent.contains(outpoint) {
            return Ok(None);
        }
        if let Some(coin) = self.added.get(outpoint) {
            return Ok(Some(coin.clone()));
        }
        self.base.coin(outpoint)
    }
}

fn corruption(err: impl std::fmt::Display) -> ValidationError {
    ValidationError::Corruption(err.to_string())
}

fn undo_key(hash: &Hash256) -> &[u8] {
    hash.as_slice()
}

pub struct UtxoTipManager<S> {
    coins: UtxoSet<Arc<S>>,
    params: ChainParams,
    verifier: Arc<dyn ScriptVerifier>,
}

impl<S: KeyValueStore> UtxoTipManager<S> {
    pub fn new(store: Arc<S>, params: ChainParams, verifier: Arc<dyn ScriptVerifier>) -> Self {
        Self {
            coins: UtxoSet::new(store),
            params,
            verifier,
        }
    }

    fn check_block_kind(&self, node: &BlockIndexNode, block: &Block) -> Result<(), ValidationError> {
        let last_pow = self.params.last_pow_height;
        if node.height <= last_pow && block.is_proof_of_stake() {
            return Err(ValidationError::dos(
                100,
                REJECT_INVALID,
                "PoS-early",
                "PoS period not active",
            ));
        }
        if node.height > last_pow && block.is_proof_of_work() {
            return Err(ValidationError::dos(
                100,
                REJECT_INVALID,
                "PoW-ended",
                "PoW period ended",
            ));
        }
        Ok(())
    }
}

impl<S: KeyValueStore> ChainTipManager for UtxoTipManager<S> {
    fn connect_tip(&mut self, node: &BlockIndexNode, block: &Block) -> Result<(), ValidationError> {
        let mut batch = WriteBatch::new();
        if node.prev.is_none() {
            self.coins.set_best_block(&mut batch, &node.hash);
            return self.coins.store().write_batch(&batch).map_err(corruption);
        }

        let best = self.coins.best_block().map_err(corruption)?;
        if best != Some(node.prev_hash) {
            return Err(ValidationError::Corruption(format!(
                "coin set is at {} but block {} builds on {}",
                best.map(|hash| hash256_to_hex(&hash)).unwrap_or_default(),
                hash256_to_hex(&node.hash),
                hash256_to_hex(&node.prev_hash)
            )));
        }
        self.check_block_kind(node, block)?;

        let mut overlay = BlockCoinsOverlay {
            base: &self.coins,
            added: HashMap::new(),
            spent: HashSet::new(),
        };
        let mut undo = BlockUndo::default();
        let mut checks = Vec::new();
        let mut sigops = 0u32;

        for (tx_index, tx) in block.transactions.iter().enumerate() {
            let txid = tx.txid();
            for index in 0..tx.vout.len() as u32 {
                if overlay
                    .coin(&OutPoint::new(txid, index))
                    .map_err(corruption)?
                    .is_some()
                {
                    return Err(ValidationError::dos(
                        100,
                        REJECT_INVALID,
                        "bad-txns-BIP30",
                        format!("tried to overwrite transaction {}", hash256_to_hex(&txid)),
                    ));
                }
            }

            sigops += legacy_sigop_count(tx);
            if !tx.is_coinbase() {
                let spent =
                    check_tx_inputs(tx, &overlay, node.height, self.params.coinbase_maturity)?;
                for (input_index, (input, coin)) in tx.vin.iter().zip(spent.coins).enumerate() {
                    sigops += p2sh_sigops(&coin.script_pubkey, &input.script_sig);
                    checks.push(ScriptCheck {
                        tx_index,
                        input_index,
                        spent: coin.output(),
                    });
                    overlay.added.remove(&input.prevout);
                    overlay.spent.insert(input.prevout.clone());
                    undo.spent.push(SpentCoin {
                        outpoint: input.prevout.clone(),
                        coin,
                    });
                }
            }
            if sigops > MAX_BLOCK_SIGOPS {
                return Err(ValidationError::dos(
                    100,
                    REJECT_INVALID,
                    "bad-blk-sigops",
                    "too many sigops",
                ));
            }

            for (index, output) in tx.vout.iter().enumerate() {
                if output.is_empty() {
                    continue;
                }
                let outpoint = OutPoint::new(txid, index as u32);
                overlay.spent.remove(&outpoint);
                overlay
                    .added
                    .insert(outpoint, Coin::from_output(output, node.height, tx));
            }
        }

        let verifier = self.verifier.as_ref();
        let result = checks.par_iter().try_for_each(|check| {
            let tx = &block.transactions[check.tx_index];
            verifier
                .verify_input(tx, check.input_index, &check.spent, BLOCK_SCRIPT_VERIFY_FLAGS)
                .map_err(|err| (check.tx_index, check.input_index, err))
        });
        if let Err((tx_index, input_index, err)) = result {
            stakd_log::log_warn!(
                "script validation failed for tx {} input {}: {}",
                hash256_to_hex(&block.transactions[tx_index].txid()),
                input_index,
                err
            );
            return Err(ValidationError::dos(
                100,
                REJECT_INVALID,
                format!("mandatory-script-verify-flag-failed ({err})"),
                format!("tx {tx_index} input {input_index}"),
            ));
        }

        let BlockCoinsOverlay { added, spent, .. } = overlay;
        for outpoint in &spent {
            self.coins.delete(&mut batch, outpoint);
        }
        for (outpoint, coin) in &added {
            self.coins.put(&mut batch, outpoint, coin);
        }
        batch.put(Column::BlockUndo, undo_key(&node.hash), undo.encode());
        self.coins.set_best_block(&mut batch, &node.hash);
        self.coins.store().write_batch(&batch).map_err(corruption)
    }

    fn disconnect_tip(
        &mut self,
        node: &BlockIndexNode,
        block: &Block,
    ) -> Result<(), ValidationError> {
        let best = self.coins.best_block().map_err(corruption)?;
        if best != Some(node.hash) {
            return Err(ValidationError::Corruption(format!(
                "cannot disconnect {}: coin set is elsewhere",
                hash256_to_hex(&node.hash)
            )));
        }
        let mut batch = WriteBatch::new();
        if node.prev.is_some() {
            let bytes = self
                .coins
                .store()
                .get(Column::BlockUndo, undo_key(&node.hash))
                .map_err(corruption)?
                .ok_or_else(|| {
                    ValidationError::Corruption(format!(
                        "missing undo data for {}",
                        hash256_to_hex(&node.hash)
                    ))
                })?;
            let undo = BlockUndo::decode(&bytes).map_err(corruption)?;

            let mut created = HashSet::new();
            for tx in &block.transactions {
                let txid = tx.txid();
                for (index, output) in tx.vout.iter().enumerate() {
                    if !output.is_empty() {
                        self.coins
                            .delete(&mut batch, &OutPoint::new(txid, index as u32));
                    }
                }
                created.insert(txid);
            }
            // coins created and spent inside this block stay gone
            for spent in undo.spent.iter().rev() {
                if !created.contains(&spent.outpoint.hash) {
                    self.coins.put(&mut batch, &spent.outpoint, &spent.coin);
                }
            }
            batch.delete(Column::BlockUndo, undo_key(&node.hash));
        }
        self.coins.set_best_block(&mut batch, &node.prev_hash);
        self.coins.store().write_batch(&batch).map_err(corruption)
    }

    fn coins(&self) -> &dyn CoinsView {
        &self.coins
    }

    fn best_block(&self) -> Result<Option<Hash256>, ValidationError> {
        self.coins.best_block().map_err(corruption)
    }
}
