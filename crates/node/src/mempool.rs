use std::collections::{HashMap, HashSet, VecDeque};

use stakd_chainstate::validation::{REJECT_INSUFFICIENTFEE, REJECT_NONSTANDARD};
use stakd_chainstate::{ChainStateError, CoinsView, Rejection, ValidationError};
use stakd_consensus::{hash256_to_hex, Hash256};
use stakd_primitives::outpoint::OutPoint;
use stakd_primitives::transaction::{Transaction, TxOut};

/// Larger orphans are dropped rather than held.
pub const MAX_ORPHAN_TX_SIZE: usize = 5000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MempoolErrorKind {
    AlreadyInMempool,
    ConflictingInput,
    /// Outputs of this transaction already exist in the chain.
    AlreadyHaveOutputs,
    MissingInput,
    NonStandard,
    InsufficientFee,
    Invalid,
    Internal,
}

/// Why a transaction was not admitted. Rule violations carry the rejection with
/// its reject code and misbehavior score; the other kinds are benign.
#[derive(Clone, Debug)]
pub struct MempoolError {
    pub kind: MempoolErrorKind,
    pub message: String,
    pub rejection: Option<Rejection>,
    pub missing_inputs: Vec<OutPoint>,
}

impl MempoolError {
    pub fn new(kind: MempoolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            rejection: None,
            missing_inputs: Vec::new(),
        }
    }

    pub fn missing_inputs(missing_inputs: Vec<OutPoint>) -> Self {
        Self {
            kind: MempoolErrorKind::MissingInput,
            message: "missing inputs".to_string(),
            rejection: None,
            missing_inputs,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        self.rejection
            .as_ref()
            .map(|rejection| rejection.reason.as_ref())
    }

    pub fn dos_score(&self) -> u32 {
        self.rejection.as_ref().map_or(0, |rejection| rejection.dos)
    }
}

impl From<ValidationError> for MempoolError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::Invalid(rejection) => {
                let kind = match rejection.code {
                    REJECT_NONSTANDARD => MempoolErrorKind::NonStandard,
                    REJECT_INSUFFICIENTFEE => MempoolErrorKind::InsufficientFee,
                    _ => MempoolErrorKind::Invalid,
                };
                Self {
                    kind,
                    message: format!("{}: {}", rejection.reason, rejection.message),
                    rejection: Some(rejection),
                    missing_inputs: Vec::new(),
                }
            }
            ValidationError::MissingData(kind) => {
                Self::new(MempoolErrorKind::MissingInput, format!("missing data: {kind:?}"))
            }
            ValidationError::Corruption(message) => Self::new(MempoolErrorKind::Internal, message),
        }
    }
}

impl From<ChainStateError> for MempoolError {
    fn from(err: ChainStateError) -> Self {
        Self::new(MempoolErrorKind::Internal, err.to_string())
    }
}

impl std::fmt::Display for MempoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MempoolError {}

#[derive(Clone, Debug)]
pub struct MempoolEntry {
    pub txid: Hash256,
    pub tx: Transaction,
    pub size: usize,
    /// Admission time, unix seconds.
    pub time: i64,
    /// Chain height when admitted.
    pub height: i32,
    pub fee: i64,
    pub value_in: i64,
    /// Sum of value times confirmations over chain inputs at admission.
    pub coin_age: f64,
    pub modified_size: usize,
    pub fee_delta: i64,
    pub priority_delta: f64,
    pub spent_outpoints: Vec<OutPoint>,
    /// In-pool transactions this one spends from.
    pub parents: Vec<Hash256>,
}

impl MempoolEntry {
    pub fn modified_fee(&self) -> i64 {
        self.fee.saturating_add(self.fee_delta)
    }

    /// Coin-age per byte the entry has once the chain reaches `height`.
    pub fn priority_at(&self, height: i32) -> f64 {
        if self.modified_size == 0 {
            return 0.0;
        }
        let confirmations = f64::from(height.saturating_sub(self.height).max(0));
        (self.coin_age + confirmations * self.value_in.max(0) as f64) / self.modified_size as f64
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Prioritisation {
    pub priority_delta: f64,
    pub fee_delta: i64,
}

#[derive(Clone, Debug)]
struct OrphanTx {
    tx: Transaction,
    sequence: u64,
    missing_parents: Vec<Hash256>,
}

/// Pending transactions, the outpoints they claim, and transactions waiting on
/// parents that have not been seen yet.
#[derive(Debug, Default)]
pub struct Mempool {
    entries: HashMap<Hash256, MempoolEntry>,
    spent: HashMap<OutPoint, Hash256>,
    children: HashMap<Hash256, Vec<Hash256>>,
    prioritisations: HashMap<Hash256, Prioritisation>,
    orphans: HashMap<Hash256, OrphanTx>,
    orphans_by_parent: HashMap<Hash256, Vec<Hash256>>,
    next_orphan_sequence: u64,
    max_orphans: usize,
    total_bytes: usize,
    revision: u64,
}

impl Mempool {
    pub fn new(max_orphans: usize) -> Self {
        Self {
            max_orphans,
            ..Self::default()
        }
    }

    /// Bumped on every change, for callers caching pool-derived data.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn spender(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spent.get(outpoint).copied()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn entries(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.entries.values()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        let mut out: Vec<_> = self.entries.keys().copied().collect();
        out.sort();
        out
    }

    /// Output `outpoint` of an in-pool transaction.
    pub fn output(&self, outpoint: &OutPoint) -> Option<TxOut> {
        let entry = self.entries.get(&outpoint.hash)?;
        entry.tx.vout.get(outpoint.index as usize).cloned()
    }

    pub fn prioritise_transaction(&mut self, txid: Hash256, priority_delta: f64, fee_delta: i64) {
        let deltas = self.prioritisations.entry(txid).or_default();
        deltas.priority_delta += priority_delta;
        deltas.fee_delta = deltas.fee_delta.saturating_add(fee_delta);

        if let Some(entry) = self.entries.get_mut(&txid) {
            entry.priority_delta += priority_delta;
            entry.fee_delta = entry.fee_delta.saturating_add(fee_delta);
        }
        stakd_log::log_info!(
            "PrioritiseTransaction: {} priority += {}, fee += {}",
            hash256_to_hex(&txid),
            priority_delta,
            fee_delta
        );
        self.revision = self.revision.saturating_add(1);
    }

    /// Deltas injected for `txid`, zero when none were set.
    pub fn deltas(&self, txid: &Hash256) -> Prioritisation {
        self.prioritisations.get(txid).copied().unwrap_or_default()
    }

    pub fn clear_prioritisation(&mut self, txid: &Hash256) {
        self.prioritisations.remove(txid);
    }

    /// Adds an entry whose checks have already passed. Fails only when the entry or
    /// one of its inputs is already claimed.
    pub fn insert(&mut self, mut entry: MempoolEntry) -> Result<(), MempoolError> {
        if self.entries.contains_key(&entry.txid) {
            return Err(MempoolError::new(
                MempoolErrorKind::AlreadyInMempool,
                "transaction already in mempool",
            ));
        }
        for outpoint in &entry.spent_outpoints {
            if let Some(conflict) = self.spent.get(outpoint) {
                return Err(MempoolError::new(
                    MempoolErrorKind::ConflictingInput,
                    format!(
                        "input {}:{} already spent by {}",
                        hash256_to_hex(&outpoint.hash),
                        outpoint.index,
                        hash256_to_hex(conflict)
                    ),
                ));
            }
        }

        let deltas = self.deltas(&entry.txid);
        entry.priority_delta = deltas.priority_delta;
        entry.fee_delta = deltas.fee_delta;

        let txid = entry.txid;
        for outpoint in &entry.spent_outpoints {
            self.spent.insert(outpoint.clone(), txid);
        }
        for parent in &entry.parents {
            let children = self.children.entry(*parent).or_default();
            if !children.contains(&txid) {
                children.push(txid);
            }
        }
        // entries already spending this one, as after a block is disconnected
        let mut existing_children = Vec::new();
        for index in 0..entry.tx.vout.len() as u32 {
            if let Some(child) = self.spent.get(&OutPoint::new(txid, index)) {
                if !existing_children.contains(child) {
                    existing_children.push(*child);
                }
            }
        }
        for child in &existing_children {
            if let Some(child_entry) = self.entries.get_mut(child) {
                child_entry.parents.push(txid);
            }
        }
        if !existing_children.is_empty() {
            self.children.entry(txid).or_default().extend(existing_children);
        }
        self.total_bytes = self.total_bytes.saturating_add(entry.size);
        self.entries.insert(txid, entry);
        self.revision = self.revision.saturating_add(1);
        Ok(())
    }

    /// Removes `txid`, and with `recursive` every in-pool descendant. Returns the
    /// removed transactions, parents first.
    pub fn remove(&mut self, txid: &Hash256, recursive: bool) -> Vec<Transaction> {
        let mut queue = VecDeque::from([*txid]);
        let mut removed = Vec::new();
        while let Some(next) = queue.pop_front() {
            let Some(entry) = self.remove_entry(&next) else {
                continue;
            };
            if recursive {
                queue.extend(self.children.remove(&next).unwrap_or_default());
            }
            removed.push(entry.tx);
        }
        removed
    }

    /// Removes the in-pool spenders of outputs of `tx`, which is not itself in
    /// the pool, along with their descendants.
    pub fn remove_spenders_of(&mut self, tx: &Transaction) -> Vec<Transaction> {
        let txid = tx.txid();
        let mut removed = Vec::new();
        for index in 0..tx.vout.len() as u32 {
            if let Some(spender) = self.spender(&OutPoint::new(txid, index)) {
                removed.extend(self.remove(&spender, true));
            }
        }
        removed
    }

    fn remove_entry(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        for outpoint in &entry.spent_outpoints {
            if self.spent.get(outpoint) == Some(txid) {
                self.spent.remove(outpoint);
            }
        }
        for parent in &entry.parents {
            let now_empty = match self.children.get_mut(parent) {
                Some(children) => {
                    children.retain(|child| child != txid);
                    children.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.children.remove(parent);
            }
        }
        if let Some(children) = self.children.get(txid) {
            for child in children.clone() {
                if let Some(child_entry) = self.entries.get_mut(&child) {
                    child_entry.parents.retain(|parent| parent != txid);
                }
            }
        }
        self.revision = self.revision.saturating_add(1);
        Some(entry)
    }

    /// Removes transactions that spend any input of `tx` other than `tx` itself,
    /// with their descendants.
    pub fn remove_conflicts(&mut self, tx: &Transaction) -> Vec<Transaction> {
        let txid = tx.txid();
        let mut removed = Vec::new();
        for input in &tx.vin {
            if let Some(conflict) = self.spender(&input.prevout) {
                if conflict != txid {
                    removed.extend(self.remove(&conflict, true));
                }
            }
        }
        removed
    }

    /// Drops transactions included in a connected block and everything that
    /// conflicts with them. Returns the conflicted transactions.
    pub fn remove_for_block(&mut self, transactions: &[Transaction]) -> Vec<Transaction> {
        let mut conflicts = Vec::new();
        for tx in transactions {
            let txid = tx.txid();
            self.remove(&txid, false);
            conflicts.extend(self.remove_conflicts(tx));
            self.clear_prioritisation(&txid);
        }
        // children of mined transactions now spend chain outputs
        for tx in transactions {
            let txid = tx.txid();
            if let Some(children) = self.children.remove(&txid) {
                for child in children {
                    if let Some(entry) = self.entries.get_mut(&child) {
                        entry.parents.retain(|parent| *parent != txid);
                    }
                }
            }
        }
        conflicts
    }

    /// After a disconnect, drops entries whose inputs are gone from both the chain
    /// and the pool, or that spend a block reward not yet mature at `pool_height`.
    pub fn remove_for_reorg(
        &mut self,
        coins: &dyn CoinsView,
        pool_height: i32,
        coinbase_maturity: i32,
    ) -> Result<Vec<Transaction>, MempoolError> {
        let mut doomed = Vec::new();
        for entry in self.entries.values() {
            for input in &entry.tx.vin {
                if self.entries.contains_key(&input.prevout.hash) {
                    continue;
                }
                let coin = coins
                    .coin(&input.prevout)
                    .map_err(|err| MempoolError::new(MempoolErrorKind::Internal, err.to_string()))?;
                let unusable = match coin {
                    None => true,
                    Some(coin) => {
                        coin.is_reward() && pool_height - coin.height < coinbase_maturity
                    }
                };
                if unusable {
                    doomed.push(entry.txid);
                    break;
                }
            }
        }
        let mut removed = Vec::new();
        for txid in doomed {
            removed.extend(self.remove(&txid, true));
        }
        Ok(removed)
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn has_orphan(&self, txid: &Hash256) -> bool {
        self.orphans.contains_key(txid)
    }

    /// Holds `tx` until one of the transactions named by `missing_inputs` arrives.
    /// The oldest orphan is evicted when the pool is full.
    pub fn add_orphan(&mut self, tx: Transaction, missing_inputs: &[OutPoint]) -> bool {
        if self.max_orphans == 0 {
            return false;
        }
        let txid = tx.txid();
        if self.orphans.contains_key(&txid) {
            return false;
        }
        let size = tx.serialized_size();
        if size > MAX_ORPHAN_TX_SIZE {
            stakd_log::log_debug_cat!(
                stakd_log::Category::Mempool,
                "ignoring large orphan tx {} (size {})",
                hash256_to_hex(&txid),
                size
            );
            return false;
        }
        let mut missing_parents: Vec<Hash256> = missing_inputs
            .iter()
            .map(|outpoint| outpoint.hash)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        missing_parents.sort();
        if missing_parents.is_empty() {
            return false;
        }

        while self.orphans.len() >= self.max_orphans {
            if !self.evict_oldest_orphan() {
                break;
            }
        }
        for parent in &missing_parents {
            self.orphans_by_parent.entry(*parent).or_default().push(txid);
        }
        let sequence = self.next_orphan_sequence;
        self.next_orphan_sequence += 1;
        self.orphans.insert(
            txid,
            OrphanTx {
                tx,
                sequence,
                missing_parents,
            },
        );
        stakd_log::log_debug_cat!(
            stakd_log::Category::Mempool,
            "stored orphan tx {} ({} orphans)",
            hash256_to_hex(&txid),
            self.orphans.len()
        );
        true
    }

    /// Takes every orphan waiting on `parent`, oldest first.
    pub fn take_orphans_for_parent(&mut self, parent: &Hash256) -> Vec<Transaction> {
        let Some(txids) = self.orphans_by_parent.remove(parent) else {
            return Vec::new();
        };
        let mut orphans: Vec<OrphanTx> = txids
            .iter()
            .filter_map(|txid| self.remove_orphan(txid))
            .collect();
        orphans.sort_by_key(|orphan| orphan.sequence);
        orphans.into_iter().map(|orphan| orphan.tx).collect()
    }

    fn evict_oldest_orphan(&mut self) -> bool {
        let Some(oldest) = self
            .orphans
            .iter()
            .min_by_key(|(_, orphan)| orphan.sequence)
            .map(|(txid, _)| *txid)
        else {
            return false;
        };
        self.remove_orphan(&oldest);
        stakd_log::log_debug_cat!(
            stakd_log::Category::Mempool,
            "orphan pool full, evicted {}",
            hash256_to_hex(&oldest)
        );
        true
    }

    fn remove_orphan(&mut self, txid: &Hash256) -> Option<OrphanTx> {
        let orphan = self.orphans.remove(txid)?;
        for parent in &orphan.missing_parents {
            let now_empty = match self.orphans_by_parent.get_mut(parent) {
                Some(waiting) => {
                    waiting.retain(|child| child != txid);
                    waiting.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.orphans_by_parent.remove(parent);
            }
        }
        Some(orphan)
    }
}
