//! Consensus constants, money rules and per-network chain parameters.

pub mod constants;
pub mod money;
pub mod params;

pub use params::{
    chain_params, hash256_from_hex, hash256_to_hex, ChainParams, Checkpoint, GenesisParams,
    HexError, Network,
};

/// Little-endian 256-bit hash as it appears on the wire.
pub type Hash256 = [u8; 32];
