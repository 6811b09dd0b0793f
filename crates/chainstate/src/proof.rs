//! Difficulty and proof-of-stake kernel checks for a block against its parent.

use stakd_consensus::Hash256;
use stakd_pos::{ModifierBlock, ProofOfStakeGenerator, StakeModifierSource, StakingData};
use stakd_pow::get_next_work_required;
use stakd_primitives::block::Block;
use stakd_script::{ScriptVerifier, STANDARD_SCRIPT_VERIFY_FLAGS};

use crate::blockindex::{BlockIndexGraph, NodeId};
use crate::chain::ChainView;
use crate::coins::CoinsView;
use crate::contextual::CheckContext;
use crate::validation::{ValidationError, REJECT_INVALID};

/// Modifier lookups answered from the block index and the active chain.
pub struct IndexModifierSource<'a> {
    pub graph: &'a BlockIndexGraph,
    pub chain: &'a ChainView,
}

impl StakeModifierSource for IndexModifierSource<'_> {
    fn block(&self, hash: &Hash256) -> Option<ModifierBlock> {
        self.graph
            .lookup(hash)
            .map(|id| self.graph.modifier_block(id))
    }

    fn active_block_at(&self, height: i32) -> Option<ModifierBlock> {
        self.chain
            .at(height)
            .map(|id| self.graph.modifier_block(id))
    }
}

fn proof_failure(message: impl Into<String>) -> ValidationError {
    ValidationError::invalid(REJECT_INVALID, "bad-proof-of-stake", message)
}

/// Checks `block.bits` against the retarget and, for proof-of-stake blocks, the
/// kernel. Returns the stake hash proof for proof-of-stake blocks.
pub fn check_work(
    ctx: &CheckContext<'_>,
    block: &Block,
    prev: NodeId,
    coins: &dyn CoinsView,
    generator: &dyn ProofOfStakeGenerator,
    verifier: &dyn ScriptVerifier,
) -> Result<Option<Hash256>, ValidationError> {
    let window = usize::try_from(ctx.params.dgw_past_blocks).unwrap_or(0) + 1;
    let required = get_next_work_required(&ctx.graph.header_infos(prev, window), ctx.params)
        .map_err(|err| ValidationError::Corruption(format!("difficulty: {err}")))?;
    let height = ctx.graph.get(prev).height + 1;
    if block.header.bits != required {
        return Err(ValidationError::invalid(
            REJECT_INVALID,
            "bad-diffbits",
            format!("incorrect proof of work at {height}"),
        ));
    }
    if !block.is_proof_of_stake() {
        return Ok(None);
    }

    let coinstake = &block.transactions[1];
    if coinstake.vin.len() > ctx.settings.max_kernel_combined_inputs {
        return Err(proof_failure(format!(
            "invalid amount of stake inputs, current: {}, max: {}",
            coinstake.vin.len(),
            ctx.settings.max_kernel_combined_inputs
        )));
    }
    let kernel = &coinstake.vin[0];
    let lookup = |index: usize| {
        coins
            .coin(&coinstake.vin[index].prevout)
            .map_err(|err| ValidationError::Corruption(err.to_string()))?
            .ok_or_else(|| proof_failure(format!("stake input {index} not found")))
    };
    let kernel_coin = lookup(0)?;
    for index in 1..coinstake.vin.len() {
        if lookup(index)?.script_pubkey != kernel_coin.script_pubkey {
            return Err(proof_failure(format!(
                "stake input {index} pays to different script"
            )));
        }
    }
    verifier
        .verify_input(coinstake, 0, &kernel_coin.output(), STANDARD_SCRIPT_VERIFY_FLAGS)
        .map_err(|err| proof_failure(format!("coinstake signature: {err}")))?;

    let block_from = ctx
        .chain
        .at(kernel_coin.height)
        .ok_or_else(|| proof_failure("stake input block not on the active chain"))?;
    let from = ctx.graph.get(block_from);
    let staking = StakingData {
        bits: block.header.bits,
        block_time_of_first_confirmation: from.time,
        block_hash_of_first_confirmation: from.hash,
        utxo_being_staked: kernel.prevout.clone(),
        utxo_value: kernel_coin.value,
        block_hash_of_chain_tip: ctx.graph.get(prev).hash,
    };
    let source = IndexModifierSource {
        graph: ctx.graph,
        chain: ctx.chain,
    };
    let proof = generator
        .compute_and_verify_proof_of_stake(&source, &staking, block.header.time)
        .map_err(|err| proof_failure(format!("check kernel failed: {err}")))?;
    Ok(Some(proof))
}
