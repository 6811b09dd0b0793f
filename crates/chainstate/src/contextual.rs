//! Checks that depend on where a header or block attaches to the index.

use stakd_consensus::{ChainParams, Hash256};
use stakd_primitives::block::{Block, BlockHeader};
use stakd_script::script_int_push;

use crate::blockindex::{BlockIndexGraph, NodeId};
use crate::chain::ChainView;
use crate::state::ChainSettings;
use crate::validation::{
    is_final_tx, ValidationError, REJECT_CHECKPOINT, REJECT_INVALID, REJECT_OBSOLETE,
};

/// Read-only view of the index state a contextual check consults.
pub struct CheckContext<'a> {
    pub graph: &'a BlockIndexGraph,
    pub chain: &'a ChainView,
    pub params: &'a ChainParams,
    pub settings: &'a ChainSettings,
    pub genesis_hash: Hash256,
}

impl CheckContext<'_> {
    /// Highest compiled-in checkpoint whose block is already indexed.
    fn last_checkpoint_height(&self) -> Option<i32> {
        self.params
            .checkpoints
            .iter()
            .filter(|checkpoint| self.graph.lookup(&checkpoint.hash).is_some())
            .map(|checkpoint| checkpoint.height)
            .max()
    }
}

pub fn contextual_check_block_header(
    ctx: &CheckContext<'_>,
    header: &BlockHeader,
    prev: NodeId,
) -> Result<(), ValidationError> {
    let hash = header.hash();
    if hash == ctx.genesis_hash {
        return Ok(());
    }
    let prev_node = ctx.graph.get(prev);
    let height = prev_node.height + 1;

    let active_height = ctx.chain.height();
    if active_height - height >= ctx.settings.max_reorg_depth {
        return Err(ValidationError::dos(
            1,
            REJECT_INVALID,
            "bad-fork-depth",
            format!(
                "fork at height {height} is {} blocks behind {active_height}",
                active_height - height
            ),
        ));
    }

    if i64::from(header.time) <= ctx.graph.median_time_past(prev) {
        return Err(ValidationError::invalid(
            REJECT_INVALID,
            "time-too-old",
            "block's timestamp is too early",
        ));
    }

    if ctx.settings.checkpoints_enabled {
        if let Some(checkpoint) = ctx.params.checkpoint_at(height) {
            if checkpoint.hash != hash {
                return Err(ValidationError::dos(
                    100,
                    REJECT_CHECKPOINT,
                    "checkpoint mismatch",
                    format!("rejected by checkpoint lock-in at {height}"),
                ));
            }
        }
        if let Some(checkpoint_height) = ctx.last_checkpoint_height() {
            if height < checkpoint_height {
                return Err(ValidationError::invalid(
                    REJECT_CHECKPOINT,
                    "bad-fork-prior-to-checkpoint",
                    format!("forked chain older than last checkpoint (height {height})"),
                ));
            }
        }
    }

    if header.version < ctx.params.min_block_version {
        return Err(ValidationError::invalid(
            REJECT_OBSOLETE,
            "bad-version",
            format!("rejected nVersion={} block", header.version),
        ));
    }
    Ok(())
}

pub fn contextual_check_block(
    block: &Block,
    graph: &BlockIndexGraph,
    prev: Option<NodeId>,
) -> Result<(), ValidationError> {
    let height = prev.map_or(0, |prev| graph.get(prev).height + 1);
    let block_time = i64::from(block.header.time);
    for tx in &block.transactions {
        if !is_final_tx(tx, height, block_time) {
            return Err(ValidationError::dos(
                10,
                REJECT_INVALID,
                "bad-txns-nonfinal",
                "contains a non-final transaction",
            ));
        }
    }

    if height > 0 {
        let expected = script_int_push(i64::from(height));
        let commits_height = block
            .transactions
            .first()
            .and_then(|coinbase| coinbase.vin.first())
            .is_some_and(|input| input.script_sig.starts_with(&expected));
        if !commits_height {
            return Err(ValidationError::dos(
                100,
                REJECT_INVALID,
                "bad-cb-height",
                "block height mismatch in coinbase",
            ));
        }
    }
    Ok(())
}
