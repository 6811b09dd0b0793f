//! Chain parameter definitions.

use crate::constants::{DEFAULT_MAX_REORG_DEPTH, MIN_BLOCK_VERSION};
use crate::money::{Amount, COIN};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "main",
            Network::Testnet => "test",
            Network::Regtest => "regtest",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Some(Network::Mainnet),
            "test" | "testnet" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

/// Inputs for building the genesis block; its hash is derived, not hard-coded.
#[derive(Clone, Debug)]
pub struct GenesisParams {
    pub version: i32,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub reward: Amount,
    pub timestamp_message: &'static str,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub message_start: [u8; 4],
    pub default_port: u16,
    pub genesis: GenesisParams,
    pub pow_limit: Hash256,
    pub pos_limit: Hash256,
    /// Last height at which proof-of-work blocks are accepted.
    pub last_pow_height: i32,
    pub pow_target_spacing: i64,
    pub pos_target_spacing: i64,
    pub pos_target_timespan: i64,
    pub pow_no_retargeting: bool,
    /// Blocks averaged by the DarkGravity retarget.
    pub dgw_past_blocks: i64,
    /// Allowed clock drift into the future for proof-of-work blocks, in seconds.
    pub max_future_block_time_pow: i64,
    /// Allowed clock drift into the future for proof-of-stake blocks, in seconds.
    pub max_future_block_time_pos: i64,
    pub min_block_version: i32,
    pub stake_min_age: i64,
    pub coinbase_maturity: i32,
    pub max_reorg_depth: i32,
    pub checkpoints: Vec<Checkpoint>,
    pub require_standard: bool,
}

impl ChainParams {
    pub fn pos_interval(&self) -> i64 {
        self.pos_target_timespan / self.pos_target_spacing
    }

    pub fn checkpoint_at(&self, height: i32) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height == height)
    }
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hash hex has invalid length"),
            HexError::InvalidHex => write!(f, "hash hex has invalid characters"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a display-order (big-endian) hex hash into wire order.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let padded = format!("{hex:0>64}");
    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out = u8::from_str_radix(&padded[start..start + 2], 16)
            .map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

/// Formats a wire-order hash in display order.
pub fn hash256_to_hex(hash: &Hash256) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => mainnet_chain_params(),
        Network::Testnet => testnet_chain_params(),
        Network::Regtest => regtest_chain_params(),
    }
}

fn limit(hex: &str) -> Hash256 {
    match hash256_from_hex(hex) {
        Ok(hash) => hash,
        Err(_) => [0xff; 32],
    }
}

fn mainnet_chain_params() -> ChainParams {
    ChainParams {
        network: Network::Mainnet,
        message_start: [0xdf, 0xa0, 0x8d, 0x8f],
        default_port: 51_472,
        genesis: GenesisParams {
            version: 1,
            time: 1_537_971_708,
            bits: 0x1e0f_fff0,
            nonce: 749_845,
            reward: 1_250 * COIN,
            timestamp_message: "stakd genesis: proof of stake, one block at a time",
        },
        pow_limit: limit("00000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pos_limit: limit("000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        last_pow_height: 100,
        pow_target_spacing: 60,
        pos_target_spacing: 60,
        pos_target_timespan: 40 * 60,
        pow_no_retargeting: false,
        dgw_past_blocks: 24,
        max_future_block_time_pow: 2 * 60 * 60,
        max_future_block_time_pos: 180,
        min_block_version: MIN_BLOCK_VERSION,
        stake_min_age: 60 * 60,
        coinbase_maturity: 20,
        max_reorg_depth: DEFAULT_MAX_REORG_DEPTH,
        checkpoints: Vec::new(),
        require_standard: true,
    }
}

fn testnet_chain_params() -> ChainParams {
    let mut params = mainnet_chain_params();
    params.network = Network::Testnet;
    params.message_start = [0xdf, 0xa0, 0x8d, 0x78];
    params.default_port = 51_474;
    params.genesis.time = 1_537_971_709;
    params.genesis.nonce = 2_307_735;
    params.stake_min_age = 60;
    params.coinbase_maturity = 1;
    params
}

fn regtest_chain_params() -> ChainParams {
    let mut params = testnet_chain_params();
    params.network = Network::Regtest;
    params.message_start = [0xa1, 0xcf, 0x7e, 0xac];
    params.default_port = 51_476;
    params.genesis.time = 1_537_971_710;
    params.genesis.bits = 0x207f_ffff;
    params.genesis.nonce = 0;
    params.pow_limit = limit("7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff");
    params.pos_limit = params.pow_limit;
    params.pow_no_retargeting = true;
    params.stake_min_age = 0;
    params.require_standard = false;
    params
}
