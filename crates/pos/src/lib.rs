//! Proof-of-stake kernel, stake modifiers and block signatures.

pub mod kernel;
pub mod modifier;
pub mod signature;

pub use kernel::{
    HashproofCreationResult, KernelProofGenerator, ProofOfStakeGenerator, StakeError, StakingData,
    HASH_DRIFT, MAXIMUM_COIN_AGE_WEIGHT_FOR_STAKING,
};
pub use modifier::{ModifierBlock, StakeModifier, StakeModifierSource};
pub use signature::{check_block_signature, sign_block_compact, sign_block_der};
