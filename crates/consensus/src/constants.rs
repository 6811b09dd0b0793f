//! Consensus-wide constants shared across validation.

/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: u32 = 2_000_000;
/// The maximum allowed number of signature check operations in a block (network rule).
pub const MAX_BLOCK_SIGOPS: u32 = MAX_BLOCK_SIZE / 50;
/// Largest transaction accepted by `CheckTransaction` and relayed by default.
pub const MAX_STANDARD_TX_SIZE: u32 = 100_000;
/// Per-transaction sigop cap used by the mempool, stricter than the block cap.
pub const MAX_STANDARD_TX_SIGOPS: u32 = MAX_BLOCK_SIGOPS / 5;
/// Coinbase scriptSig length bounds, inclusive.
pub const MIN_COINBASE_SCRIPT_LEN: usize = 2;
pub const MAX_COINBASE_SCRIPT_LEN: usize = 150;
/// Number of ancestors used for median-time-past.
pub const MEDIAN_TIME_SPAN: usize = 11;
/// Lock times below this value are block heights, above it unix timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;
/// Default maximum reorganization depth.
pub const DEFAULT_MAX_REORG_DEPTH: i32 = 100;

pub const CURRENT_TX_VERSION: i32 = 2;
pub const CURRENT_BLOCK_VERSION: i32 = 4;
/// Headers below this version are obsolete once past genesis.
pub const MIN_BLOCK_VERSION: i32 = 3;

/// Sigops allowed in a non-template P2SH redeem script.
pub const MAX_P2SH_SIGOPS: u32 = 15;
/// Largest `OP_META` output relayed by default (payload plus opcode and push bytes).
pub const MAX_OP_META_RELAY: usize = 603;
/// Bytes of a block reserved for high-priority free transactions.
pub const DEFAULT_BLOCK_PRIORITY_SIZE: usize = 50_000;

/// Maximum script size (consensus).
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Current network protocol version for P2P messages.
pub const PROTOCOL_VERSION: i32 = 70_915;
