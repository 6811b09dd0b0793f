//! Block index state, best-chain activation and index persistence.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use std::time::Instant;

use primitive_types::U256;
use stakd_consensus::{hash256_to_hex, ChainParams, Hash256, Network};
use stakd_log::Category;
use stakd_pos::{check_block_signature, ProofOfStakeGenerator};
use stakd_primitives::block::{Block, BlockHeader};
use stakd_primitives::encoding::DecodeError;
use stakd_script::ScriptVerifier;
use stakd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::blockindex::{
    BlockIndexGraph, NodeId, StoredBlockIndex, BLOCK_FAILED_CHILD, BLOCK_FAILED_MASK,
    BLOCK_FAILED_VALID, BLOCK_HAVE_DATA, BLOCK_HAVE_UNDO, BLOCK_VALID_SCRIPTS,
    BLOCK_VALID_TRANSACTIONS, BLOCK_VALID_TREE,
};
use crate::candidates::{is_worse, CandidateSet, UnlinkedBlocks};
use crate::chain::ChainView;
use crate::coins::CoinsView;
use crate::contextual::{contextual_check_block, contextual_check_block_header, CheckContext};
use crate::flatfiles::{FileLocation, FlatFileError, FlatFileStore};
use crate::genesis::build_genesis_block;
use crate::proof::{check_work, IndexModifierSource};
use crate::tip::{ChainTipManager, UtxoTipManager};
use crate::validation::{
    check_block, Clock, MissingKind, ValidationError, REJECT_DUPLICATE, REJECT_INVALID,
};

/// Blocks connected per activation window before re-checking the best candidate.
const CONNECT_WINDOW: i32 = 32;
const META_BEST_TIP: &[u8] = b"best_chain_tip";
/// Maximum inputs a coinstake may combine into its kernel.
pub const DEFAULT_MAX_KERNEL_COMBINED_INPUTS: usize = 20;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainSettings {
    pub max_reorg_depth: i32,
    pub checkpoints_enabled: bool,
    /// Run the full index consistency walk after every change.
    pub check_block_index: bool,
    pub max_kernel_combined_inputs: usize,
}

impl ChainSettings {
    pub fn for_params(params: &ChainParams) -> Self {
        Self {
            max_reorg_depth: params.max_reorg_depth,
            checkpoints_enabled: true,
            check_block_index: params.network == Network::Regtest,
            max_kernel_combined_inputs: DEFAULT_MAX_KERNEL_COMBINED_INPUTS,
        }
    }
}

#[derive(Debug)]
pub enum ChainStateError {
    Validation(ValidationError),
    Store(StoreError),
    FlatFile(FlatFileError),
    Decode(DecodeError),
    UnknownBlock(Hash256),
    CorruptIndex(String),
    CannotInvalidateGenesis,
    Poisoned,
}

impl ChainStateError {
    /// The rule violation behind this error, if any.
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            ChainStateError::Validation(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStateError::Validation(err) => write!(f, "{err}"),
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::FlatFile(err) => write!(f, "{err}"),
            ChainStateError::Decode(err) => write!(f, "{err}"),
            ChainStateError::UnknownBlock(hash) => {
                write!(f, "block {} not found", hash256_to_hex(hash))
            }
            ChainStateError::CorruptIndex(message) => write!(f, "corrupt block index: {message}"),
            ChainStateError::CannotInvalidateGenesis => write!(f, "cannot invalidate genesis"),
            ChainStateError::Poisoned => write!(f, "chain state lock poisoned"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<ValidationError> for ChainStateError {
    fn from(err: ValidationError) -> Self {
        ChainStateError::Validation(err)
    }
}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<FlatFileError> for ChainStateError {
    fn from(err: FlatFileError) -> Self {
        ChainStateError::FlatFile(err)
    }
}

impl From<DecodeError> for ChainStateError {
    fn from(err: DecodeError) -> Self {
        ChainStateError::Decode(err)
    }
}

/// Summary of one block index entry as seen by callers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: Hash256,
    pub height: i32,
    pub chain_work: U256,
    pub chain_tx: u64,
    pub time: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub tip: ChainTip,
    pub status: u32,
    pub tx_count: u32,
    pub sequence_id: u64,
    pub on_active_chain: bool,
    pub is_candidate: bool,
    pub stake_modifier: u64,
    pub hash_proof: Hash256,
}

/// Changes made to the active chain by one activation cycle.
#[derive(Clone, Debug, Default)]
pub struct ActivationStep {
    /// Connected blocks with their heights, oldest first.
    pub connected: Vec<(Block, i32)>,
    /// Disconnected blocks, tip first.
    pub disconnected: Vec<Block>,
    pub tip: Option<ChainTip>,
    /// Set when a connect attempt failed a consensus rule.
    pub invalid_found: bool,
}

impl ActivationStep {
    pub fn is_empty(&self) -> bool {
        self.connected.is_empty() && self.disconnected.is_empty()
    }
}

/// Consistent read view handed to callers that must not race tip changes.
pub struct ChainReadView<'a> {
    pub coins: &'a dyn CoinsView,
    pub tip: Option<ChainTip>,
    /// Median time past of the tip.
    pub median_time_past: i64,
}

/// Everything guarded by the main chain lock.
pub(crate) struct ChainInner {
    pub(crate) graph: BlockIndexGraph,
    pub(crate) chain: ChainView,
    pub(crate) candidates: CandidateSet,
    pub(crate) unlinked: UnlinkedBlocks,
    pub(crate) proof_map: HashMap<Hash256, Hash256>,
    pub(crate) best_invalid: Option<NodeId>,
    pub(crate) next_sequence_id: u64,
    pub(crate) tip_manager: Box<dyn ChainTipManager>,
}

impl ChainInner {
    fn new(tip_manager: Box<dyn ChainTipManager>) -> Self {
        Self {
            graph: BlockIndexGraph::new(),
            chain: ChainView::new(),
            candidates: CandidateSet::new(),
            unlinked: UnlinkedBlocks::new(),
            proof_map: HashMap::new(),
            best_invalid: None,
            next_sequence_id: 1,
            tip_manager,
        }
    }

    fn summary(&self, id: NodeId) -> ChainTip {
        let node = self.graph.get(id);
        ChainTip {
            hash: node.hash,
            height: node.height,
            chain_work: node.chain_work,
            chain_tx: node.chain_tx,
            time: node.time,
        }
    }

    fn tip_summary(&self) -> Option<ChainTip> {
        self.chain.tip().map(|tip| self.summary(tip))
    }

    /// Eligible for selection: transactions checked, full ancestry data, and no
    /// worse than the tip.
    fn is_candidate_eligible(&self, id: NodeId) -> bool {
        let node = self.graph.get(id);
        node.is_valid(BLOCK_VALID_TRANSACTIONS)
            && node.chain_tx > 0
            && self
                .chain
                .tip()
                .map_or(true, |tip| !is_worse(&self.graph, id, tip))
    }

    fn invalid_chain_found(&mut self, id: NodeId) {
        let more_work = self
            .best_invalid
            .map_or(true, |best| self.graph.get(id).chain_work > self.graph.get(best).chain_work);
        if more_work {
            self.best_invalid = Some(id);
        }
        let node = self.graph.get(id);
        stakd_log::log_warn!(
            "InvalidChainFound: invalid block={} height={} work={}",
            hash256_to_hex(&node.hash),
            node.height,
            node.chain_work
        );
        if let Some(tip) = self.chain.tip() {
            let tip = self.graph.get(tip);
            stakd_log::log_warn!(
                "InvalidChainFound: current best={} height={} work={}",
                hash256_to_hex(&tip.hash),
                tip.height,
                tip.chain_work
            );
        }
    }

    fn invalid_block_found(&mut self, id: NodeId, err: &ValidationError) {
        if err.marks_invalid() {
            self.graph.get_mut(id).status |= BLOCK_FAILED_VALID;
            self.graph.mark_dirty(id);
            self.candidates.remove(id);
            self.invalid_chain_found(id);
        }
    }

    /// Records that a block's transactions arrived and links it, and any
    /// descendants waiting on it, into the candidate set.
    /// Records block data for `id`. Returns false when the node was marked failed
    /// in the meantime; such a node never gets `BLOCK_HAVE_DATA`.
    fn received_block_transactions(
        &mut self,
        id: NodeId,
        block: &Block,
        location: FileLocation,
    ) -> bool {
        if self.graph.get(id).failed() {
            return false;
        }
        {
            let node = self.graph.get_mut(id);
            node.tx_count = block.transactions.len() as u32;
            node.chain_tx = 0;
            node.data_pos = Some(location);
            node.status |= BLOCK_HAVE_DATA;
            node.proof_of_stake = block.is_proof_of_stake();
            node.raise_validity(BLOCK_VALID_TRANSACTIONS);
        }
        self.graph.mark_dirty(id);

        let prev = self.graph.get(id).prev;
        let parent_linked = prev.map_or(true, |prev| self.graph.get(prev).chain_tx > 0);
        if !parent_linked {
            if let Some(prev) = prev {
                if self.graph.get(prev).is_valid(BLOCK_VALID_TREE) {
                    self.unlinked.insert(prev, id);
                }
            }
            return true;
        }

        let mut queue = VecDeque::from([id]);
        while let Some(next) = queue.pop_front() {
            let parent_tx = self
                .graph
                .get(next)
                .prev
                .map_or(0, |prev| self.graph.get(prev).chain_tx);
            let sequence_id = self.next_sequence_id;
            self.next_sequence_id += 1;
            {
                let node = self.graph.get_mut(next);
                node.chain_tx = parent_tx + u64::from(node.tx_count);
                node.sequence_id = sequence_id;
            }
            if self.is_candidate_eligible(next) {
                self.candidates.insert(&self.graph, next);
            }
            queue.extend(self.unlinked.take(next));
        }
        true
    }
}

/// Owner of the block index, the active chain and the coin set.
///
/// A single `RwLock` guards all index and chain mutation. Block bytes are written
/// to the flat files outside that lock.
pub struct ChainState<S> {
    store: Arc<S>,
    blocks: FlatFileStore,
    params: ChainParams,
    settings: ChainSettings,
    genesis_hash: Hash256,
    generator: Arc<dyn ProofOfStakeGenerator>,
    verifier: Arc<dyn ScriptVerifier>,
    clock: Arc<dyn Clock>,
    inner: RwLock<ChainInner>,
}

impl<S: KeyValueStore + 'static> ChainState<S> {
    pub fn new(
        store: Arc<S>,
        blocks: FlatFileStore,
        params: ChainParams,
        settings: ChainSettings,
        generator: Arc<dyn ProofOfStakeGenerator>,
        verifier: Arc<dyn ScriptVerifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let tip_manager = Box::new(UtxoTipManager::new(
            Arc::clone(&store),
            params.clone(),
            Arc::clone(&verifier),
        ));
        Self::with_tip_manager(
            store,
            blocks,
            params,
            settings,
            generator,
            verifier,
            clock,
            tip_manager,
        )
    }
}

impl<S: KeyValueStore> ChainState<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn with_tip_manager(
        store: Arc<S>,
        blocks: FlatFileStore,
        params: ChainParams,
        settings: ChainSettings,
        generator: Arc<dyn ProofOfStakeGenerator>,
        verifier: Arc<dyn ScriptVerifier>,
        clock: Arc<dyn Clock>,
        tip_manager: Box<dyn ChainTipManager>,
    ) -> Self {
        let genesis_hash = build_genesis_block(&params).hash();
        Self {
            store,
            blocks,
            params,
            settings,
            genesis_hash,
            generator,
            verifier,
            clock,
            inner: RwLock::new(ChainInner::new(tip_manager)),
        }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn settings(&self) -> &ChainSettings {
        &self.settings
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis_hash
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    fn read_inner(&self) -> Result<RwLockReadGuard<'_, ChainInner>, ChainStateError> {
        self.inner.read().map_err(|_| ChainStateError::Poisoned)
    }

    fn write_inner(&self) -> Result<RwLockWriteGuard<'_, ChainInner>, ChainStateError> {
        self.inner.write().map_err(|_| ChainStateError::Poisoned)
    }

    /// Stores and activates the genesis block when the index is empty.
    pub fn init_genesis(&self) -> Result<(), ChainStateError> {
        if !self.read_inner()?.graph.is_empty() {
            return Ok(());
        }
        let genesis = build_genesis_block(&self.params);
        self.accept_block(&genesis, true)?;
        self.activate_best_chain()?;
        stakd_log::log_info!("initialized genesis {}", hash256_to_hex(&self.genesis_hash));
        Ok(())
    }

    /// Adds a header to the index without its transactions.
    pub fn process_block_header(&self, header: &BlockHeader) -> Result<Hash256, ChainStateError> {
        self.reconsider_checkpointed_prev(header)?;
        let mut inner = self.write_inner()?;
        let id = self.accept_block_header(&mut inner, header)?;
        Ok(inner.graph.get(id).hash)
    }

    /// Full entry point for a block from the network or a miner: context-free
    /// checks, signature, storage, then chain activation.
    pub fn process_new_block(&self, block: &Block) -> Result<Vec<ActivationStep>, ChainStateError> {
        let hash = block.hash();
        let started = Instant::now();
        if let Err(err) = check_block(block, &self.params, self.clock.adjusted_time()) {
            stakd_log::log_debug_cat!(
                Category::Validation,
                "CheckBlock failed for {}: {}",
                hash256_to_hex(&hash),
                err
            );
            return Err(err.into());
        }
        if let Err(err) = check_block_signature(block) {
            return Err(ValidationError::invalid(
                REJECT_INVALID,
                "bad-blk-signature",
                format!("bad block signature: {err}"),
            )
            .into());
        }

        if let Err(err) = self.accept_block(block, true) {
            stakd_log::log_debug_cat!(
                Category::Validation,
                "AcceptBlock failed for {}: {}",
                hash256_to_hex(&hash),
                err
            );
            return Err(err);
        }
        if self.settings.check_block_index {
            self.read_inner()?.verify_block_index_tree(&self.genesis_hash);
        }
        let steps = self.activate_best_chain()?;
        stakd_log::log_debug_cat!(
            Category::Bench,
            "processed block {} in {:.2}ms",
            hash256_to_hex(&hash),
            started.elapsed().as_secs_f64() * 1000.0
        );
        Ok(steps)
    }

    fn check_context<'a>(&'a self, inner: &'a ChainInner) -> CheckContext<'a> {
        CheckContext {
            graph: &inner.graph,
            chain: &inner.chain,
            params: &self.params,
            settings: &self.settings,
            genesis_hash: self.genesis_hash,
        }
    }

    /// Clears the failure of a parent that is an exact checkpoint match so its
    /// child can be accepted. Returns true when the parent was reconsidered.
    fn reconsider_checkpointed_prev(&self, header: &BlockHeader) -> Result<bool, ChainStateError> {
        if !self.settings.checkpoints_enabled || header.hash() == self.genesis_hash {
            return Ok(false);
        }
        let height = {
            let inner = self.read_inner()?;
            let Some(prev) = inner.graph.lookup(&header.prev_block) else {
                return Ok(false);
            };
            let node = inner.graph.get(prev);
            if !node.failed() {
                return Ok(false);
            }
            node.height
        };
        let matches = self
            .params
            .checkpoint_at(height)
            .is_some_and(|checkpoint| checkpoint.hash == header.prev_block);
        if !matches {
            return Ok(false);
        }
        stakd_log::log_info!(
            "Reconsidering block {} height {}",
            hash256_to_hex(&header.prev_block),
            height
        );
        self.reconsider_block(&header.prev_block)?;
        Ok(true)
    }

    fn resolve_prev(
        &self,
        inner: &ChainInner,
        header: &BlockHeader,
    ) -> Result<Option<NodeId>, ValidationError> {
        if header.hash() == self.genesis_hash {
            return Ok(None);
        }
        let prev = inner
            .graph
            .lookup(&header.prev_block)
            .ok_or(ValidationError::MissingData(MissingKind::PrevBlock))?;
        if inner.graph.get(prev).failed() {
            return Err(ValidationError::dos(
                100,
                REJECT_INVALID,
                "bad-prevblk",
                "previous block is invalid",
            ));
        }
        Ok(Some(prev))
    }

    fn accept_block_header(
        &self,
        inner: &mut ChainInner,
        header: &BlockHeader,
    ) -> Result<NodeId, ValidationError> {
        let hash = header.hash();
        if let Some(existing) = inner.graph.lookup(&hash) {
            if inner.graph.get(existing).failed() {
                return Err(ValidationError::invalid(
                    REJECT_DUPLICATE,
                    "duplicate",
                    "block is marked invalid",
                ));
            }
            return Ok(existing);
        }
        let prev = self.resolve_prev(inner, header)?;
        if let Some(prev) = prev {
            contextual_check_block_header(&self.check_context(inner), header, prev)?;
        }

        let id = inner.graph.insert_header(header, prev);
        let modifier = {
            let source = IndexModifierSource {
                graph: &inner.graph,
                chain: &inner.chain,
            };
            let prev_block = prev.map(|prev| inner.graph.modifier_block(prev));
            self.generator
                .compute_stake_modifier(&source, prev_block.as_ref())
        };
        match modifier {
            Ok(modifier) => inner.graph.get_mut(id).stake_modifier = modifier,
            Err(err) => stakd_log::log_warn!(
                "failed to compute stake modifier for {}: {}",
                hash256_to_hex(&hash),
                err
            ),
        }
        stakd_log::log_debug_cat!(
            Category::Index,
            "indexed header {} at height {}",
            hash256_to_hex(&hash),
            inner.graph.get(id).height
        );
        Ok(id)
    }

    /// Validates a block against its parent and stores it. Accepting a block whose
    /// data is already stored succeeds without changes.
    fn accept_block(&self, block: &Block, already_checked: bool) -> Result<(), ChainStateError> {
        let hash = block.hash();
        self.reconsider_checkpointed_prev(&block.header)?;
        {
            let mut inner = self.write_inner()?;
            let prev = self.resolve_prev(&inner, &block.header)?;
            if let Some(prev) = prev {
                let proof = check_work(
                    &self.check_context(&inner),
                    block,
                    prev,
                    inner.tip_manager.coins(),
                    self.generator.as_ref(),
                    self.verifier.as_ref(),
                )?;
                if let Some(proof) = proof {
                    inner.proof_map.insert(hash, proof);
                }
            }
            let id = self.accept_block_header(&mut inner, &block.header)?;
            if let Some(proof) = inner.proof_map.remove(&hash) {
                inner.graph.get_mut(id).hash_proof = proof;
                inner.graph.mark_dirty(id);
            }
            if inner.graph.get(id).have_data() {
                return Ok(());
            }

            let checked = if already_checked {
                Ok(())
            } else {
                check_block(block, &self.params, self.clock.adjusted_time())
            };
            if let Err(err) =
                checked.and_then(|()| contextual_check_block(block, &inner.graph, prev))
            {
                if err.marks_invalid() {
                    inner.graph.get_mut(id).status |= BLOCK_FAILED_VALID;
                    inner.graph.mark_dirty(id);
                }
                return Err(err.into());
            }
        }

        let location = self.blocks.append(&block.consensus_encode())?;

        let mut inner = self.write_inner()?;
        let id = inner
            .graph
            .lookup(&hash)
            .ok_or_else(|| ChainStateError::CorruptIndex("accepted header vanished".into()))?;
        if !inner.graph.get(id).have_data()
            && !inner.received_block_transactions(id, block, location)
        {
            stakd_log::log_debug_cat!(
                Category::Validation,
                "block {} was invalidated while its data was written",
                hash256_to_hex(&hash)
            );
        }
        Ok(())
    }

    /// Moves the active chain to the best valid candidate, releasing the lock
    /// between cycles. Returns one step per cycle that changed the chain.
    pub fn activate_best_chain(&self) -> Result<Vec<ActivationStep>, ChainStateError> {
        let mut steps = Vec::new();
        self.activate_with(false, &mut |step| steps.push(step.clone()))?;
        Ok(steps)
    }

    /// Like [`ChainState::activate_best_chain`] but gives up immediately when the
    /// chain lock is busy. Returns `None` in that case.
    pub fn try_activate_best_chain(&self) -> Result<Option<Vec<ActivationStep>>, ChainStateError> {
        let mut steps = Vec::new();
        let ran = self.activate_with(true, &mut |step| steps.push(step.clone()))?;
        Ok(ran.then_some(steps))
    }

    /// Runs activation cycles, calling `on_step` after each one with the lock
    /// released.
    pub fn activate_with(
        &self,
        try_lock: bool,
        on_step: &mut dyn FnMut(&ActivationStep),
    ) -> Result<bool, ChainStateError> {
        let mut first = true;
        loop {
            let step = {
                let mut inner = if first && try_lock {
                    match self.inner.try_write() {
                        Ok(guard) => guard,
                        Err(TryLockError::WouldBlock) => return Ok(false),
                        Err(TryLockError::Poisoned(_)) => return Err(ChainStateError::Poisoned),
                    }
                } else {
                    self.write_inner()?
                };
                first = false;
                let Some(most_work) = inner.find_most_work_chain() else {
                    break;
                };
                if inner.chain.tip() == Some(most_work) {
                    break;
                }
                self.activate_step(&mut inner, most_work)?
            };
            if !step.is_empty() {
                on_step(&step);
            }
        }

        let mut inner = self.write_inner()?;
        if self.settings.check_block_index {
            inner.verify_block_index_tree(&self.genesis_hash);
        }
        self.flush_locked(&mut inner)?;
        Ok(true)
    }

    fn read_block_at(
        &self,
        location: Option<FileLocation>,
        hash: &Hash256,
    ) -> Result<Block, ValidationError> {
        let location = location.ok_or_else(|| {
            ValidationError::Corruption(format!("no data for block {}", hash256_to_hex(hash)))
        })?;
        let bytes = self
            .blocks
            .read(location)
            .map_err(|err| ValidationError::Corruption(err.to_string()))?;
        Block::consensus_decode(&bytes).map_err(|err| ValidationError::Corruption(err.to_string()))
    }

    fn log_update_tip(&self, inner: &ChainInner) {
        if let Some(tip) = inner.chain.tip() {
            let node = inner.graph.get(tip);
            stakd_log::log_info!(
                "UpdateTip: new best={} height={} work={} tx={}",
                hash256_to_hex(&node.hash),
                node.height,
                node.chain_work,
                node.chain_tx
            );
        }
    }

    fn disconnect_tip(&self, inner: &mut ChainInner) -> Result<Block, ValidationError> {
        let Some(tip) = inner.chain.tip() else {
            panic!("BUG: disconnect with an empty chain");
        };
        let (data_pos, hash, prev) = {
            let node = inner.graph.get(tip);
            (node.data_pos, node.hash, node.prev)
        };
        let block = self.read_block_at(data_pos, &hash)?;
        {
            let ChainInner {
                graph,
                tip_manager,
                ..
            } = &mut *inner;
            tip_manager.disconnect_tip(graph.get(tip), &block)?;
        }
        inner.chain.set_tip(&inner.graph, prev);
        self.log_update_tip(inner);
        Ok(block)
    }

    fn connect_tip(&self, inner: &mut ChainInner, id: NodeId) -> Result<Block, ValidationError> {
        let started = Instant::now();
        let (data_pos, hash) = {
            let node = inner.graph.get(id);
            (node.data_pos, node.hash)
        };
        let block = self.read_block_at(data_pos, &hash)?;
        {
            let ChainInner {
                graph,
                tip_manager,
                ..
            } = &mut *inner;
            tip_manager.connect_tip(graph.get(id), &block)?;
        }
        let node = inner.graph.get_mut(id);
        node.raise_validity(BLOCK_VALID_SCRIPTS);
        if node.prev.is_some() {
            node.status |= BLOCK_HAVE_UNDO;
        }
        inner.graph.mark_dirty(id);
        inner.chain.set_tip(&inner.graph, Some(id));
        self.log_update_tip(inner);
        stakd_log::log_debug_cat!(
            Category::Bench,
            "connect block {}: {:.2}ms",
            hash256_to_hex(&hash),
            started.elapsed().as_secs_f64() * 1000.0
        );
        Ok(block)
    }

    /// One cycle towards `most_work`: disconnect to the fork, then connect in
    /// windows until the tip has more work than it started with.
    fn activate_step(
        &self,
        inner: &mut ChainInner,
        most_work: NodeId,
    ) -> Result<ActivationStep, ValidationError> {
        let mut step = ActivationStep::default();
        let old_tip = inner.chain.tip();
        let fork = inner.chain.find_fork(&inner.graph, most_work);

        while inner.chain.tip().is_some() && inner.chain.tip() != fork {
            step.disconnected.push(self.disconnect_tip(inner)?);
        }

        let target_height = inner.graph.get(most_work).height;
        let mut height = fork.map_or(-1, |fork| inner.graph.get(fork).height);
        'windows: while height < target_height {
            let window_end = (height + CONNECT_WINDOW).min(target_height);
            let mut to_connect = Vec::new();
            let mut walk = inner.graph.ancestor(most_work, window_end);
            while let Some(id) = walk {
                if inner.graph.get(id).height <= height {
                    break;
                }
                to_connect.push(id);
                walk = inner.graph.get(id).prev;
            }
            to_connect.reverse();

            for id in to_connect {
                match self.connect_tip(inner, id) {
                    Ok(block) => {
                        step.connected.push((block, inner.graph.get(id).height));
                        inner.prune_candidates();
                        let improved = old_tip.map_or(true, |old| {
                            inner.graph.get(id).chain_work > inner.graph.get(old).chain_work
                        });
                        if improved {
                            break 'windows;
                        }
                    }
                    Err(err @ ValidationError::Invalid(_)) if err.marks_invalid() => {
                        stakd_log::log_debug_cat!(
                            Category::Validation,
                            "ConnectTip failed for {}: {}",
                            hash256_to_hex(&inner.graph.get(id).hash),
                            err
                        );
                        inner.invalid_block_found(id, &err);
                        step.invalid_found = true;
                        break 'windows;
                    }
                    Err(ValidationError::MissingData(kind)) => {
                        return Err(ValidationError::Corruption(format!(
                            "missing {kind:?} while connecting {}",
                            hash256_to_hex(&inner.graph.get(id).hash)
                        )));
                    }
                    Err(err) => return Err(err),
                }
            }
            height = window_end;
        }

        step.tip = inner.tip_summary();
        Ok(step)
    }

    /// Marks a block invalid and rewinds the active chain below it. Call
    /// [`ChainState::activate_best_chain`] afterwards to pick the next best chain.
    pub fn invalidate_block(&self, hash: &Hash256) -> Result<ActivationStep, ChainStateError> {
        let mut guard = self.write_inner()?;
        let inner = &mut *guard;
        let id = inner
            .graph
            .lookup(hash)
            .ok_or(ChainStateError::UnknownBlock(*hash))?;
        if inner.graph.get(id).prev.is_none() {
            return Err(ChainStateError::CannotInvalidateGenesis);
        }

        inner.graph.get_mut(id).status |= BLOCK_FAILED_VALID;
        inner.graph.mark_dirty(id);
        inner.candidates.remove(id);

        let mut step = ActivationStep::default();
        while inner.chain.contains(&inner.graph, id) {
            let Some(tip) = inner.chain.tip() else {
                break;
            };
            if tip != id {
                inner.graph.get_mut(tip).status |= BLOCK_FAILED_CHILD;
                inner.graph.mark_dirty(tip);
            }
            inner.candidates.remove(tip);
            step.disconnected.push(self.disconnect_tip(inner)?);
        }

        let eligible: Vec<NodeId> = inner
            .graph
            .ids()
            .filter(|candidate| inner.is_candidate_eligible(*candidate))
            .collect();
        for candidate in eligible {
            inner.candidates.insert(&inner.graph, candidate);
        }
        inner.invalid_chain_found(id);
        step.tip = inner.tip_summary();
        if self.settings.check_block_index {
            inner.verify_block_index_tree(&self.genesis_hash);
        }
        Ok(step)
    }

    /// Clears failure flags from a block, its descendants and its ancestors.
    pub fn reconsider_block(&self, hash: &Hash256) -> Result<(), ChainStateError> {
        let mut guard = self.write_inner()?;
        let inner = &mut *guard;
        let id = inner
            .graph
            .lookup(hash)
            .ok_or(ChainStateError::UnknownBlock(*hash))?;
        let height = inner.graph.get(id).height;

        let affected: Vec<NodeId> = inner
            .graph
            .ids()
            .filter(|other| {
                inner.graph.get(*other).failed() && inner.graph.ancestor(*other, height) == Some(id)
            })
            .collect();
        for other in affected {
            inner.graph.get_mut(other).status &= !BLOCK_FAILED_MASK;
            inner.graph.mark_dirty(other);
            if inner.is_candidate_eligible(other) {
                inner.candidates.insert(&inner.graph, other);
            }
            if inner.best_invalid == Some(other) {
                inner.best_invalid = None;
            }
        }

        let mut walk = inner.graph.get(id).prev;
        while let Some(ancestor) = walk {
            if inner.graph.get(ancestor).failed() {
                inner.graph.get_mut(ancestor).status &= !BLOCK_FAILED_MASK;
                inner.graph.mark_dirty(ancestor);
                if inner.is_candidate_eligible(ancestor) {
                    inner.candidates.insert(&inner.graph, ancestor);
                }
                if inner.best_invalid == Some(ancestor) {
                    inner.best_invalid = None;
                }
            }
            walk = inner.graph.get(ancestor).prev;
        }
        Ok(())
    }

    /// Persists dirty index entries and the active tip. Returns the number of
    /// entries written.
    pub fn flush(&self) -> Result<usize, ChainStateError> {
        let mut inner = self.write_inner()?;
        self.flush_locked(&mut inner)
    }

    fn flush_locked(&self, inner: &mut ChainInner) -> Result<usize, ChainStateError> {
        let dirty = inner.graph.take_dirty();
        let mut batch = WriteBatch::new();
        for id in &dirty {
            let (hash, record) = inner.graph.record(*id);
            batch.put(Column::BlockIndex, &hash, record);
        }
        if let Some(tip) = inner.chain.tip() {
            batch.put(Column::Meta, META_BEST_TIP, inner.graph.get(tip).hash.to_vec());
        }
        if let Err(err) = self.store.write_batch(&batch) {
            for id in dirty {
                inner.graph.mark_dirty(id);
            }
            return Err(err.into());
        }
        if !dirty.is_empty() {
            stakd_log::log_debug_cat!(Category::Index, "flushed {} block index entries", dirty.len());
        }
        Ok(dirty.len())
    }

    /// Rebuilds the in-memory index from the store. Returns the number of entries
    /// loaded; zero means a fresh data directory.
    pub fn load(&self) -> Result<usize, ChainStateError> {
        let mut records = Vec::new();
        for (key, value) in self.store.scan_prefix(Column::BlockIndex, &[])? {
            let hash: Hash256 = key
                .as_slice()
                .try_into()
                .map_err(|_| ChainStateError::CorruptIndex("bad block index key".into()))?;
            records.push(StoredBlockIndex::decode(hash, &value)?);
        }
        if records.is_empty() {
            return Ok(0);
        }
        records.sort_by_key(|record| record.height);

        let file_ids: Vec<u32> = records
            .iter()
            .filter_map(|record| record.data_pos.map(|pos| pos.file_id))
            .collect();
        if !self.blocks.files_present(file_ids) {
            return Err(ChainStateError::CorruptIndex("block files are missing".into()));
        }

        let mut inner = self.write_inner()?;
        let ChainInner {
            graph,
            chain,
            candidates,
            unlinked,
            proof_map,
            best_invalid,
            next_sequence_id,
            tip_manager,
        } = &mut *inner;
        *graph = BlockIndexGraph::new();
        *chain = ChainView::new();
        *candidates = CandidateSet::new();
        *unlinked = UnlinkedBlocks::new();
        proof_map.clear();
        *best_invalid = None;
        *next_sequence_id = 1;

        for record in records {
            let is_genesis = record.hash == self.genesis_hash;
            if !is_genesis && graph.lookup(&record.header.prev_block).is_none() {
                return Err(ChainStateError::CorruptIndex(format!(
                    "block {} has no parent in the index",
                    hash256_to_hex(&record.hash)
                )));
            }
            if is_genesis != (record.height == 0) {
                return Err(ChainStateError::CorruptIndex("unexpected root entry".into()));
            }
            graph.insert_stored(record);
        }

        let ids: Vec<NodeId> = graph.ids().collect();
        for id in &ids {
            let id = *id;
            let prev = graph.get(id).prev;
            if graph.get(id).have_data() {
                match prev {
                    None => {
                        let node = graph.get_mut(id);
                        node.chain_tx = u64::from(node.tx_count);
                    }
                    Some(prev) => {
                        let parent_tx = graph.get(prev).chain_tx;
                        if parent_tx > 0 {
                            let node = graph.get_mut(id);
                            node.chain_tx = parent_tx + u64::from(node.tx_count);
                        } else {
                            unlinked.insert(prev, id);
                        }
                    }
                }
            }
            let node = graph.get(id);
            if node.is_valid(BLOCK_VALID_TRANSACTIONS) && node.chain_tx > 0 {
                candidates.insert(graph, id);
            }
            if node.status & BLOCK_FAILED_VALID != 0
                && best_invalid.map_or(true, |best| node.chain_work > graph.get(best).chain_work)
            {
                *best_invalid = Some(id);
            }
        }

        let stored_tip = self
            .store
            .get(Column::Meta, META_BEST_TIP)?
            .and_then(|bytes| Hash256::try_from(bytes.as_slice()).ok());
        let coins_tip = tip_manager.best_block()?;
        if coins_tip.is_some() && stored_tip != coins_tip {
            stakd_log::log_warn!(
                "index tip {} differs from coin set tip {}, following the coin set",
                stored_tip.map(|hash| hash256_to_hex(&hash)).unwrap_or_default(),
                coins_tip.map(|hash| hash256_to_hex(&hash)).unwrap_or_default()
            );
        }
        let tip_hash = coins_tip.or(stored_tip);
        let tip = match tip_hash {
            Some(hash) => Some(graph.lookup(&hash).ok_or_else(|| {
                ChainStateError::CorruptIndex(format!(
                    "chain tip {} not in the index",
                    hash256_to_hex(&hash)
                ))
            })?),
            None => None,
        };
        chain.set_tip(graph, tip);
        inner.prune_candidates();

        let count = inner.graph.len();
        if let Some(tip) = inner.tip_summary() {
            stakd_log::log_info!(
                "loaded block index: {} entries, tip {} at height {}",
                count,
                hash256_to_hex(&tip.hash),
                tip.height
            );
        }
        if self.settings.check_block_index {
            inner.verify_block_index_tree(&self.genesis_hash);
        }
        Ok(count)
    }

    /// Runs the index consistency walk now, regardless of settings.
    pub fn verify_block_index(&self) -> Result<(), ChainStateError> {
        self.read_inner()?.verify_block_index_tree(&self.genesis_hash);
        Ok(())
    }

    pub fn tip(&self) -> Result<Option<ChainTip>, ChainStateError> {
        Ok(self.read_inner()?.tip_summary())
    }

    pub fn best_header(&self) -> Result<Option<ChainTip>, ChainStateError> {
        let inner = self.read_inner()?;
        Ok(inner.graph.best_header().map(|id| inner.summary(id)))
    }

    pub fn best_invalid(&self) -> Result<Option<ChainTip>, ChainStateError> {
        let inner = self.read_inner()?;
        Ok(inner.best_invalid.map(|id| inner.summary(id)))
    }

    /// Hash of the active chain block at `height`.
    pub fn hash_at(&self, height: i32) -> Result<Option<Hash256>, ChainStateError> {
        let inner = self.read_inner()?;
        Ok(inner.chain.at(height).map(|id| inner.graph.get(id).hash))
    }

    pub fn candidate_count(&self) -> Result<usize, ChainStateError> {
        Ok(self.read_inner()?.candidates.len())
    }

    pub fn block_info(&self, hash: &Hash256) -> Result<Option<BlockInfo>, ChainStateError> {
        let inner = self.read_inner()?;
        Ok(inner.graph.lookup(hash).map(|id| {
            let node = inner.graph.get(id);
            BlockInfo {
                tip: inner.summary(id),
                status: node.status,
                tx_count: node.tx_count,
                sequence_id: node.sequence_id,
                on_active_chain: inner.chain.contains(&inner.graph, id),
                is_candidate: inner.candidates.contains(id),
                stake_modifier: node.stake_modifier.value,
                hash_proof: node.hash_proof,
            }
        }))
    }

    /// Reads a stored block back from the flat files.
    pub fn read_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainStateError> {
        let data_pos = {
            let inner = self.read_inner()?;
            match inner.graph.lookup(hash) {
                Some(id) => inner.graph.get(id).data_pos,
                None => return Ok(None),
            }
        };
        let Some(location) = data_pos else {
            return Ok(None);
        };
        let bytes = self.blocks.read(location)?;
        Ok(Some(Block::consensus_decode(&bytes)?))
    }

    /// Runs `f` against the coin set and tip under the chain read lock, so the
    /// view cannot move while `f` runs.
    pub fn with_view<R>(
        &self,
        f: impl FnOnce(&ChainReadView<'_>) -> R,
    ) -> Result<R, ChainStateError> {
        let inner = self.read_inner()?;
        let view = ChainReadView {
            coins: inner.tip_manager.coins(),
            tip: inner.tip_summary(),
            median_time_past: inner
                .chain
                .tip()
                .map_or(0, |tip| inner.graph.median_time_past(tip)),
        };
        Ok(f(&view))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stakd_consensus::chain_params;
    use stakd_script::TemplateVerifier;
    use stakd_storage::memory::MemoryStore;

    fn empty_inner() -> (ChainInner, ChainParams) {
        let params = chain_params(Network::Regtest);
        let tip_manager = UtxoTipManager::new(
            Arc::new(MemoryStore::new()),
            params.clone(),
            Arc::new(TemplateVerifier),
        );
        (ChainInner::new(Box::new(tip_manager)), params)
    }

    fn with_genesis_tip(inner: &mut ChainInner, params: &ChainParams) -> (NodeId, Block) {
        let genesis = build_genesis_block(params);
        let id = inner.graph.insert_header(&genesis.header, None);
        assert!(inner.received_block_transactions(id, &genesis, LOCATION));
        inner.chain.set_tip(&inner.graph, Some(id));
        (id, genesis)
    }

    fn child_of(parent: &Block, time_offset: u32) -> Block {
        let mut block = parent.clone();
        block.header.prev_block = parent.hash();
        block.header.time = parent.header.time + time_offset;
        block
    }

    const LOCATION: FileLocation = FileLocation {
        file_id: 0,
        offset: 0,
        len: 1,
    };

    #[test]
    fn failed_child_below_an_invalid_block_is_consistent() {
        let (mut inner, params) = empty_inner();
        let (genesis_id, genesis) = with_genesis_tip(&mut inner, &params);
        let bad = child_of(&genesis, 60);
        let bad_id = inner.graph.insert_header(&bad.header, Some(genesis_id));
        assert!(inner.received_block_transactions(bad_id, &bad, LOCATION));
        inner.graph.get_mut(bad_id).status |= BLOCK_FAILED_VALID;
        inner.candidates.remove(bad_id);

        let follower = child_of(&bad, 60);
        let follower_id = inner.graph.insert_header(&follower.header, Some(bad_id));
        inner.graph.get_mut(follower_id).status |= BLOCK_FAILED_CHILD;

        inner.verify_block_index_tree(&genesis.hash());
    }

    #[test]
    #[should_panic(expected = "failed flag without a failed ancestor")]
    fn failed_child_without_invalid_ancestor_is_reported() {
        let (mut inner, params) = empty_inner();
        let (genesis_id, genesis) = with_genesis_tip(&mut inner, &params);
        let orphaned = child_of(&genesis, 60);
        let orphaned_id = inner.graph.insert_header(&orphaned.header, Some(genesis_id));
        inner.graph.get_mut(orphaned_id).status |= BLOCK_FAILED_CHILD;

        inner.verify_block_index_tree(&genesis.hash());
    }

    fn pow_child(params: &ChainParams, parent: &Block) -> Block {
        let mut script_sig = stakd_script::script_int_push(1);
        script_sig.push(0);
        let coinbase = stakd_primitives::transaction::Transaction {
            version: 1,
            vin: vec![stakd_primitives::transaction::TxIn::new(
                stakd_primitives::outpoint::OutPoint::null(),
                script_sig,
            )],
            vout: vec![stakd_primitives::transaction::TxOut::new(
                stakd_consensus::money::COIN,
                stakd_script::standard::p2pkh_script(&[0u8; 20]),
            )],
            lock_time: 0,
        };
        let mut block = Block {
            header: BlockHeader {
                version: stakd_consensus::constants::CURRENT_BLOCK_VERSION,
                prev_block: parent.hash(),
                merkle_root: [0u8; 32],
                time: parent.header.time + 60,
                bits: params.genesis.bits,
                nonce: 0,
            },
            transactions: vec![coinbase],
            block_sig: Vec::new(),
        };
        block.header.merkle_root = stakd_primitives::merkle::block_merkle_root(&block).0;
        while stakd_pow::check_proof_of_work(&block.hash(), block.header.bits, params).is_err() {
            block.header.nonce += 1;
        }
        block
    }

    #[test]
    fn pending_proof_is_claimed_once_by_the_block() {
        let dir = tempfile::tempdir().expect("tempdir");
        let params = chain_params(Network::Regtest);
        let blocks = FlatFileStore::open(
            dir.path(),
            params.message_start,
            crate::flatfiles::DEFAULT_MAX_BLOCKFILE_SIZE,
        )
        .expect("block files");
        let clock = crate::validation::FixedClock(i64::from(params.genesis.time) + 1_000_000);
        let chain = ChainState::new(
            Arc::new(MemoryStore::new()),
            blocks,
            params.clone(),
            ChainSettings::for_params(&params),
            Arc::new(stakd_pos::KernelProofGenerator::new(0)),
            Arc::new(TemplateVerifier),
            Arc::new(clock),
        );
        chain.init_genesis().expect("genesis");
        let child = pow_child(&params, &build_genesis_block(&params));
        let proof = [7u8; 32];
        chain
            .write_inner()
            .expect("lock")
            .proof_map
            .insert(child.hash(), proof);

        chain.process_block_header(&child.header).expect("header");
        let header_only = chain.block_info(&child.hash()).expect("info").expect("indexed");
        assert_eq!(header_only.hash_proof, [0u8; 32]);
        assert!(chain.read_inner().expect("lock").proof_map.contains_key(&child.hash()));

        chain.process_new_block(&child).expect("block");
        let stored = chain.block_info(&child.hash()).expect("info").expect("indexed");
        assert_eq!(stored.hash_proof, proof);
        assert!(chain.read_inner().expect("lock").proof_map.is_empty());
    }

    #[test]
    fn failed_node_never_receives_data() {
        let (mut inner, params) = empty_inner();
        let genesis = build_genesis_block(&params);
        let id = inner.graph.insert_header(&genesis.header, None);
        inner.graph.get_mut(id).status |= BLOCK_FAILED_VALID;

        let location = FileLocation {
            file_id: 0,
            offset: 0,
            len: 1,
        };
        assert!(!inner.received_block_transactions(id, &genesis, location));
        let node = inner.graph.get(id);
        assert!(!node.have_data());
        assert_eq!(node.chain_tx, 0);
        assert!(!inner.candidates.contains(id));
    }

    #[test]
    fn healthy_node_becomes_candidate_on_data() {
        let (mut inner, params) = empty_inner();
        let genesis = build_genesis_block(&params);
        let id = inner.graph.insert_header(&genesis.header, None);

        let location = FileLocation {
            file_id: 0,
            offset: 0,
            len: 1,
        };
        assert!(inner.received_block_transactions(id, &genesis, location));
        assert!(inner.graph.get(id).is_valid(BLOCK_VALID_TRANSACTIONS));
        assert!(inner.candidates.contains(id));
    }
}
