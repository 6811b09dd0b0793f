//! Ties the chain state to the transaction pool: every change to the active chain
//! is mirrored into the pool and announced to listeners.

use std::sync::Arc;

use stakd_chainstate::{ActivationStep, ChainState, ChainStateError};
use stakd_consensus::{hash256_to_hex, Hash256};
use stakd_log::Category;
use stakd_primitives::block::Block;
use stakd_primitives::transaction::Transaction;
use stakd_storage::KeyValueStore;

use crate::admission::TxPool;
use crate::mempool::{MempoolError, MempoolErrorKind};
use crate::notify::SyncType;

#[derive(Debug)]
pub enum NodeError {
    Chain(ChainStateError),
    Mempool(MempoolError),
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeError::Chain(err) => write!(f, "{err}"),
            NodeError::Mempool(err) => write!(f, "mempool: {err}"),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<ChainStateError> for NodeError {
    fn from(err: ChainStateError) -> Self {
        NodeError::Chain(err)
    }
}

impl From<MempoolError> for NodeError {
    fn from(err: MempoolError) -> Self {
        NodeError::Mempool(err)
    }
}

pub struct NodeContext<S> {
    chain: Arc<ChainState<S>>,
    pool: Arc<TxPool>,
}

impl<S> Clone for NodeContext<S> {
    fn clone(&self) -> Self {
        Self {
            chain: Arc::clone(&self.chain),
            pool: Arc::clone(&self.pool),
        }
    }
}

impl<S: KeyValueStore + 'static> NodeContext<S> {
    pub fn new(chain: Arc<ChainState<S>>, pool: Arc<TxPool>) -> Self {
        Self { chain, pool }
    }

    pub fn chain(&self) -> &Arc<ChainState<S>> {
        &self.chain
    }

    pub fn pool(&self) -> &Arc<TxPool> {
        &self.pool
    }

    /// Validates and stores `block`, activates the best chain and updates the pool.
    pub fn process_block(&self, block: &Block) -> Result<Vec<ActivationStep>, NodeError> {
        let steps = self.chain.process_new_block(block)?;
        self.apply_steps(&steps)?;
        Ok(steps)
    }

    pub fn activate_best_chain(&self) -> Result<Vec<ActivationStep>, NodeError> {
        let steps = self.chain.activate_best_chain()?;
        self.apply_steps(&steps)?;
        Ok(steps)
    }

    /// Like [`NodeContext::activate_best_chain`], but returns `None` without waiting
    /// when the chain lock is held elsewhere.
    pub fn try_activate_best_chain(&self) -> Result<Option<Vec<ActivationStep>>, NodeError> {
        let Some(steps) = self.chain.try_activate_best_chain()? else {
            return Ok(None);
        };
        self.apply_steps(&steps)?;
        Ok(Some(steps))
    }

    pub fn invalidate_block(&self, hash: &Hash256) -> Result<(), NodeError> {
        let step = self.chain.invalidate_block(hash)?;
        self.apply_step(&step)?;
        self.activate_best_chain()?;
        Ok(())
    }

    pub fn reconsider_block(&self, hash: &Hash256) -> Result<(), NodeError> {
        self.chain.reconsider_block(hash)?;
        self.activate_best_chain()?;
        Ok(())
    }

    /// Relays a loose transaction into the pool, resolving orphans it unblocks.
    pub fn submit_transaction(&self, tx: &Transaction) -> Result<Vec<Hash256>, MempoolError> {
        self.pool.process_transaction(&self.chain, tx)
    }

    fn apply_steps(&self, steps: &[ActivationStep]) -> Result<(), NodeError> {
        for step in steps {
            self.apply_step(step)?;
        }
        Ok(())
    }

    /// Returns transactions of disconnected blocks to the pool, evicts what the
    /// new tip makes unusable, then drops what connected blocks mined or spent.
    pub fn apply_step(&self, step: &ActivationStep) -> Result<(), NodeError> {
        let hub = self.pool.hub();

        for block in &step.disconnected {
            let block = Arc::new(block.clone());
            for tx in &block.transactions {
                hub.sync_transaction(tx, Some(&block), SyncType::BlockDisconnect);
            }
            for tx in &block.transactions {
                if tx.is_coinbase() || tx.is_coinstake() {
                    continue;
                }
                if let Err(err) = self.pool.accept_to_memory_pool(&self.chain, tx, false, false) {
                    stakd_log::log_debug_cat!(
                        Category::Mempool,
                        "not returning {} to the mempool: {}",
                        hash256_to_hex(&tx.txid()),
                        err
                    );
                    // outputs still exist when the new chain mined the same transaction
                    let outputs_live = matches!(
                        err.kind,
                        MempoolErrorKind::AlreadyInMempool | MempoolErrorKind::AlreadyHaveOutputs
                    );
                    if !outputs_live {
                        self.pool.with_mempool(|pool| pool.remove_spenders_of(tx))?;
                    }
                }
            }
        }

        if !step.disconnected.is_empty() {
            let maturity = self.chain.params().coinbase_maturity;
            let removed = self.chain.with_view(|view| {
                let pool_height = view.tip.as_ref().map_or(0, |tip| tip.height) + 1;
                self.pool
                    .with_mempool(|pool| pool.remove_for_reorg(view.coins, pool_height, maturity))
                    .and_then(|removed| removed)
            })??;
            if !removed.is_empty() {
                stakd_log::log_debug_cat!(
                    Category::Mempool,
                    "removed {} mempool transactions made invalid by the reorg",
                    removed.len()
                );
            }
        }

        for (block, _height) in &step.connected {
            let block = Arc::new(block.clone());
            let conflicts = self
                .pool
                .with_mempool(|pool| pool.remove_for_block(&block.transactions))?;
            for tx in &conflicts {
                hub.sync_transaction(tx, None, SyncType::Conflicted);
            }
            for tx in &block.transactions {
                hub.sync_transaction(tx, Some(&block), SyncType::NewBlock);
            }
        }

        if let Some(tip) = &step.tip {
            hub.updated_block_tip(tip);
        }
        Ok(())
    }
}
