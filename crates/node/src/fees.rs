//! Fee and priority gate for loose transactions, including the free-relay rate limiter.

use std::sync::Mutex;

use stakd_chainstate::validation::{ValidationError, REJECT_INSUFFICIENTFEE};
use stakd_consensus::constants::DEFAULT_BLOCK_PRIORITY_SIZE;
use stakd_consensus::money::COIN;
use stakd_log::Category;
use stakd_primitives::transaction::Transaction;

use crate::policy::MempoolPolicy;

/// Transactions below this size may skip the relay fee when they carry priority.
pub const FREE_TX_SIZE_LIMIT: usize = DEFAULT_BLOCK_PRIORITY_SIZE - 1000;
/// Coin-age per byte above which a transaction is relayed without a fee.
pub const ALLOW_FREE_THRESHOLD: f64 = COIN as f64 * 1440.0 / 250.0;
/// Per-second decay of the free-relay counter, a window of roughly ten minutes.
const FREE_RELAY_DECAY: f64 = 1.0 - 1.0 / 600.0;

pub fn min_relay_fee_for_size(min_fee_per_kb: i64, size: usize) -> i64 {
    if min_fee_per_kb <= 0 {
        return 0;
    }
    let size = i64::try_from(size).unwrap_or(i64::MAX);
    let fee = min_fee_per_kb.saturating_mul(size) / 1000;
    if fee == 0 {
        min_fee_per_kb
    } else {
        fee
    }
}

/// Size used for priority. Each input's fixed overhead and up to 110 bytes of its
/// scriptSig are not charged.
pub fn calculate_modified_size(tx: &Transaction, tx_size: usize) -> usize {
    let mut size = tx_size;
    for input in &tx.vin {
        let offset = 41 + input.script_sig.len().min(110);
        if size > offset {
            size -= offset;
        }
    }
    size
}

pub fn allow_free(priority: f64) -> bool {
    priority > ALLOW_FREE_THRESHOLD
}

/// Small transactions, and ones with an injected fee or priority boost, may pass
/// without the relay fee.
pub fn tx_should_be_prioritized(size: usize, priority_delta: f64, fee_delta: i64) -> bool {
    priority_delta > 0.0 || fee_delta > 0 || size < FREE_TX_SIZE_LIMIT
}

#[derive(Debug, Default)]
struct LimiterState {
    count: f64,
    last_time: i64,
}

/// Exponentially decaying budget for transactions paying less than the relay fee.
#[derive(Debug)]
pub struct FreeRelayLimiter {
    limit_kb_per_minute: u64,
    state: Mutex<LimiterState>,
}

impl FreeRelayLimiter {
    pub fn new(limit_kb_per_minute: u64) -> Self {
        Self {
            limit_kb_per_minute,
            state: Mutex::new(LimiterState::default()),
        }
    }

    /// Charges `size` bytes at time `now` (seconds), or refuses when the decayed
    /// count has reached the limit.
    pub fn allow(&self, size: usize, now: i64) -> Result<(), ValidationError> {
        let threshold = self.limit_kb_per_minute as f64 * 10.0 * 1000.0;
        let mut state = self.state.lock().map_err(|_| {
            ValidationError::Corruption("free relay limiter lock poisoned".to_string())
        })?;

        let elapsed = now.saturating_sub(state.last_time).max(0);
        state.count *= FREE_RELAY_DECAY.powf(elapsed as f64);
        state.last_time = now;

        if state.count >= threshold {
            return Err(ValidationError::invalid(
                REJECT_INSUFFICIENTFEE,
                "rate limited free transaction",
                "free transaction rejected by rate limiter",
            ));
        }
        stakd_log::log_debug_cat!(
            Category::Mempool,
            "rate limit free count: {:.0} => {:.0}",
            state.count,
            state.count + size as f64
        );
        state.count += size as f64;
        Ok(())
    }

    /// Current undecayed counter value.
    pub fn count(&self) -> f64 {
        self.state.lock().map(|state| state.count).unwrap_or(0.0)
    }
}

/// What the fee gate needs to know about a candidate entry.
#[derive(Clone, Copy, Debug)]
pub struct FeeCheck {
    pub size: usize,
    pub fee: i64,
    /// Coin-age per byte the transaction would have in the next block.
    pub priority: f64,
    pub priority_delta: f64,
    pub fee_delta: i64,
}

/// Rejects transactions that pay less than the relay fee for their size unless
/// they qualify as free; free ones must have enough priority and fit the rate
/// limiter.
pub fn check_fees_paid(
    check: &FeeCheck,
    limit_free: bool,
    policy: &MempoolPolicy,
    limiter: &FreeRelayLimiter,
    now: i64,
) -> Result<(), ValidationError> {
    let min_fee = policy.min_relay_fee_for_size(check.size);
    let prioritized = tx_should_be_prioritized(check.size, check.priority_delta, check.fee_delta);
    if limit_free && !prioritized && check.fee < min_fee {
        return Err(ValidationError::invalid(
            REJECT_INSUFFICIENTFEE,
            "insufficient fee",
            format!("not enough fees, {} < {}", check.fee, min_fee),
        ));
    }
    if policy.relay_priority && check.fee < min_fee && !allow_free(check.priority) {
        return Err(ValidationError::invalid(
            REJECT_INSUFFICIENTFEE,
            "insufficient priority",
            format!("priority {:.0} below free threshold", check.priority),
        ));
    }
    if limit_free && check.fee < min_fee {
        limiter.allow(check.size, now)?;
    }
    Ok(())
}
