//! Validation results and the context-free block and transaction checks.

use std::borrow::Cow;
use std::collections::HashSet;

use stakd_consensus::constants::{
    LOCKTIME_THRESHOLD, MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE, MAX_COINBASE_SCRIPT_LEN,
    MAX_STANDARD_TX_SIZE, MIN_COINBASE_SCRIPT_LEN,
};
use stakd_consensus::money::money_range;
use stakd_consensus::ChainParams;
use stakd_pow::check_proof_of_work;
use stakd_primitives::block::Block;
use stakd_primitives::merkle::block_merkle_root;
use stakd_primitives::outpoint::OutPoint;
use stakd_primitives::transaction::Transaction;
use stakd_script::count_sigops;

pub const REJECT_MALFORMED: u8 = 0x01;
pub const REJECT_INVALID: u8 = 0x10;
pub const REJECT_OBSOLETE: u8 = 0x11;
pub const REJECT_DUPLICATE: u8 = 0x12;
pub const REJECT_NONSTANDARD: u8 = 0x40;
pub const REJECT_DUST: u8 = 0x41;
pub const REJECT_INSUFFICIENTFEE: u8 = 0x42;
pub const REJECT_CHECKPOINT: u8 = 0x43;

/// A consensus or policy rejection as reported to peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    pub code: u8,
    pub reason: Cow<'static, str>,
    /// Misbehavior score for the peer that supplied the data.
    pub dos: u32,
    /// The data may be damaged rather than invalid; the block must not be marked failed.
    pub corruption_possible: bool,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MissingKind {
    PrevBlock,
    Inputs,
    BlockData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Invalid(Rejection),
    /// Retry once more data arrives; nothing is marked invalid.
    MissingData(MissingKind),
    /// Disk or database failure; aborts the operation.
    Corruption(String),
}

impl ValidationError {
    pub fn dos(
        dos: u32,
        code: u8,
        reason: impl Into<Cow<'static, str>>,
        message: impl Into<String>,
    ) -> Self {
        ValidationError::Invalid(Rejection {
            code,
            reason: reason.into(),
            dos,
            corruption_possible: false,
            message: message.into(),
        })
    }

    pub fn invalid(
        code: u8,
        reason: impl Into<Cow<'static, str>>,
        message: impl Into<String>,
    ) -> Self {
        Self::dos(0, code, reason, message)
    }

    pub fn with_corruption_possible(mut self) -> Self {
        if let ValidationError::Invalid(rejection) = &mut self {
            rejection.corruption_possible = true;
        }
        self
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            ValidationError::Invalid(rejection) => Some(rejection),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        self.rejection().map(|rejection| rejection.reason.as_ref())
    }

    pub fn dos_score(&self) -> u32 {
        self.rejection().map_or(0, |rejection| rejection.dos)
    }

    /// True for rule violations that may permanently mark a block invalid.
    pub fn marks_invalid(&self) -> bool {
        matches!(self, ValidationError::Invalid(rejection) if !rejection.corruption_possible)
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Invalid(rejection) => write!(
                f,
                "{} (code {:#04x}, dos {}): {}",
                rejection.reason, rejection.code, rejection.dos, rejection.message
            ),
            ValidationError::MissingData(kind) => write!(f, "missing data: {kind:?}"),
            ValidationError::Corruption(message) => write!(f, "corruption: {message}"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Source of network-adjusted time.
pub trait Clock: Send + Sync {
    fn adjusted_time(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn adjusted_time(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or(0)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn adjusted_time(&self) -> i64 {
        self.0
    }
}

pub fn legacy_sigop_count(tx: &Transaction) -> u32 {
    let inputs: u32 = tx
        .vin
        .iter()
        .map(|input| count_sigops(&input.script_sig, false))
        .sum();
    let outputs: u32 = tx
        .vout
        .iter()
        .map(|output| count_sigops(&output.script_pubkey, false))
        .sum();
    inputs + outputs
}

/// Lock time satisfied at `height`/`block_time`, or every input opted out of it.
pub fn is_final_tx(tx: &Transaction, height: i32, block_time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let threshold = if tx.lock_time < LOCKTIME_THRESHOLD {
        i64::from(height)
    } else {
        block_time
    };
    if i64::from(tx.lock_time) < threshold {
        return true;
    }
    tx.vin.iter().all(|input| input.is_final())
}

pub fn check_transaction(
    tx: &Transaction,
    used_inputs: &mut HashSet<OutPoint>,
) -> Result<(), ValidationError> {
    if tx.vin.is_empty() {
        return Err(ValidationError::dos(10, REJECT_INVALID, "bad-txns-vin-empty", "vin empty"));
    }
    if tx.vout.is_empty() {
        return Err(ValidationError::dos(10, REJECT_INVALID, "bad-txns-vout-empty", "vout empty"));
    }
    let size = tx.serialized_size();
    if size > MAX_STANDARD_TX_SIZE as usize {
        return Err(ValidationError::dos(
            100,
            REJECT_INVALID,
            "bad-txns-oversize",
            format!("size limits failed: {size} bytes"),
        ));
    }

    let mut value_out = 0i64;
    let user_tx = !tx.is_coinbase() && !tx.is_coinstake();
    for output in &tx.vout {
        if output.is_empty() && user_tx {
            return Err(ValidationError::dos(
                100,
                REJECT_INVALID,
                "bad-txns-vout-empty-for-user-tx",
                "txout empty for user transaction",
            ));
        }
        if !money_range(output.value) {
            return Err(ValidationError::dos(
                100,
                REJECT_INVALID,
                "bad-txns-vout-negative-or-toolarge",
                "txout value out of range",
            ));
        }
        value_out = value_out.saturating_add(output.value);
        if !money_range(value_out) {
            return Err(ValidationError::dos(
                100,
                REJECT_INVALID,
                "bad-txns-txouttotal-toolarge",
                "txout total out of range",
            ));
        }
    }

    for input in &tx.vin {
        if !used_inputs.insert(input.prevout.clone()) {
            return Err(ValidationError::dos(
                100,
                REJECT_INVALID,
                "bad-txns-inputs-duplicate",
                "duplicate inputs",
            ));
        }
    }

    if tx.is_coinbase() {
        let len = tx.vin[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_LEN..=MAX_COINBASE_SCRIPT_LEN).contains(&len) {
            return Err(ValidationError::dos(
                100,
                REJECT_INVALID,
                "bad-cb-length",
                format!("coinbase script size {len}"),
            ));
        }
    }
    Ok(())
}

/// Context-free block checks. `now` is the adjusted network time.
pub fn check_block(block: &Block, params: &ChainParams, now: i64) -> Result<(), ValidationError> {
    let hash = block.hash();
    let proof_of_stake = block.is_proof_of_stake();

    if !proof_of_stake && check_proof_of_work(&hash, block.header.bits, params).is_err() {
        return Err(ValidationError::dos(
            150,
            REJECT_INVALID,
            "bad-header: high-hash",
            "proof of work failed",
        )
        .with_corruption_possible());
    }

    let drift = if proof_of_stake {
        params.max_future_block_time_pos
    } else {
        params.max_future_block_time_pow
    };
    if i64::from(block.header.time) > now + drift {
        return Err(ValidationError::invalid(
            REJECT_INVALID,
            "time-too-new",
            "block timestamp too far in the future",
        ));
    }

    let (merkle_root, mutated) = block_merkle_root(block);
    if merkle_root != block.header.merkle_root {
        return Err(ValidationError::dos(
            100,
            REJECT_INVALID,
            "bad-txnmrklroot",
            "hashMerkleRoot mismatch",
        )
        .with_corruption_possible());
    }
    if mutated {
        return Err(ValidationError::dos(
            100,
            REJECT_INVALID,
            "bad-txns-duplicate",
            "duplicate transaction",
        )
        .with_corruption_possible());
    }

    if block.transactions.is_empty()
        || block.transactions.len() > MAX_BLOCK_SIZE as usize
        || block.serialized_size() > MAX_BLOCK_SIZE as usize
    {
        return Err(ValidationError::dos(
            100,
            REJECT_INVALID,
            "bad-blk-length",
            "size limits failed",
        ));
    }

    if !block.transactions[0].is_coinbase() {
        return Err(ValidationError::dos(
            100,
            REJECT_INVALID,
            "bad-cb-missing",
            "first tx is not coinbase",
        ));
    }
    if block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Err(ValidationError::dos(
            100,
            REJECT_INVALID,
            "bad-cb-multiple",
            "more than one coinbase",
        ));
    }

    if proof_of_stake {
        let coinbase = &block.transactions[0];
        if coinbase.vout.len() != 1 || !coinbase.vout[0].is_empty() {
            return Err(ValidationError::dos(
                100,
                REJECT_INVALID,
                "coinbase output not empty for proof-of-stake block",
                "coinbase output not empty for proof-of-stake block",
            ));
        }
        if !block.transactions[1].is_coinstake() {
            return Err(ValidationError::dos(
                100,
                REJECT_INVALID,
                "second tx is not coinstake",
                "second tx is not coinstake",
            ));
        }
        if block.transactions[2..].iter().any(Transaction::is_coinstake) {
            return Err(ValidationError::dos(
                100,
                REJECT_INVALID,
                "more than one coinstake",
                "more than one coinstake",
            ));
        }
    }

    let mut used_inputs = HashSet::new();
    for tx in &block.transactions {
        check_transaction(tx, &mut used_inputs)?;
    }

    let sigops: u32 = block.transactions.iter().map(legacy_sigop_count).sum();
    if sigops > MAX_BLOCK_SIGOPS {
        return Err(ValidationError::dos(
            100,
            REJECT_INVALID,
            "bad-blk-sigops",
            format!("out-of-bounds sigop count {sigops}"),
        )
        .with_corruption_possible());
    }
    Ok(())
}
