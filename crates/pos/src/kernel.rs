//! Stake kernel hashing and target checks.

use primitive_types::U256;
use stakd_consensus::money::{Amount, COIN};
use stakd_consensus::Hash256;
use stakd_pow::{compact_to_u256, CompactError};
use stakd_primitives::encoding::Encoder;
use stakd_primitives::hash::sha256d;
use stakd_primitives::outpoint::OutPoint;

use crate::modifier::{
    compute_next_stake_modifier, kernel_stake_modifier, ModifierBlock, StakeModifier,
    StakeModifierSource,
};

/// Number of timestamps tried, counting down from the initial one, when searching for a kernel.
pub const HASH_DRIFT: u32 = 45;
/// Coin age stops adding weight after one week less an hour.
pub const MAXIMUM_COIN_AGE_WEIGHT_FOR_STAKING: i64 = 60 * 60 * 24 * 7 - 60 * 60;

#[derive(Debug)]
pub enum StakeError {
    TimestampBeforeStake { stake_time: u32, hashproof_time: u32 },
    MinimumAgeNotMet { stake_time: u32, hashproof_time: u32 },
    ModifierUnavailable(&'static str),
    TargetMissed(Hash256),
    Compact(CompactError),
    BadSignature(&'static str),
}

impl std::fmt::Display for StakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StakeError::TimestampBeforeStake {
                stake_time,
                hashproof_time,
            } => write!(
                f,
                "hashproof timestamp {hashproof_time} precedes stake time {stake_time}"
            ),
            StakeError::MinimumAgeNotMet {
                stake_time,
                hashproof_time,
            } => write!(
                f,
                "min age violation: stake time {stake_time}, hashproof timestamp {hashproof_time}"
            ),
            StakeError::ModifierUnavailable(message) => {
                write!(f, "stake modifier unavailable: {message}")
            }
            StakeError::TargetMissed(_) => write!(f, "kernel hash does not meet target"),
            StakeError::Compact(err) => write!(f, "{err}"),
            StakeError::BadSignature(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StakeError {}

impl From<CompactError> for StakeError {
    fn from(err: CompactError) -> Self {
        StakeError::Compact(err)
    }
}

/// Everything the kernel check needs about one staked output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StakingData {
    pub bits: u32,
    pub block_time_of_first_confirmation: u32,
    pub block_hash_of_first_confirmation: Hash256,
    pub utxo_being_staked: OutPoint,
    pub utxo_value: Amount,
    pub block_hash_of_chain_tip: Hash256,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashproofCreationResult {
    Success(u32),
    FailedSetup,
    FailedGeneration,
}

impl HashproofCreationResult {
    pub fn succeeded(self) -> bool {
        matches!(self, HashproofCreationResult::Success(_))
    }

    pub fn timestamp(self) -> Option<u32> {
        match self {
            HashproofCreationResult::Success(timestamp) => Some(timestamp),
            _ => None,
        }
    }
}

pub trait ProofOfStakeGenerator: Send + Sync {
    /// Hashes the kernel at `hashproof_timestamp` and returns the proof hash when it
    /// meets the target.
    fn compute_and_verify_proof_of_stake(
        &self,
        source: &dyn StakeModifierSource,
        staking: &StakingData,
        hashproof_timestamp: u32,
    ) -> Result<Hash256, StakeError>;

    /// Searches up to [`HASH_DRIFT`] timestamps downward from `initial_timestamp`.
    fn create_hashproof_timestamp(
        &self,
        source: &dyn StakeModifierSource,
        staking: &StakingData,
        initial_timestamp: u32,
    ) -> HashproofCreationResult;

    /// Modifier for a new block whose parent is `prev`.
    fn compute_stake_modifier(
        &self,
        source: &dyn StakeModifierSource,
        prev: Option<&ModifierBlock>,
    ) -> Result<StakeModifier, StakeError>;
}

struct ProofOfStakeCalculator {
    utxo: OutPoint,
    value: Amount,
    modifier: u64,
    target_per_coin_day: U256,
    stake_time: u32,
}

impl ProofOfStakeCalculator {
    fn stake_hash(&self, hashproof_timestamp: u32) -> Hash256 {
        let mut encoder = Encoder::with_capacity(52);
        encoder.write_u64_le(self.modifier);
        encoder.write_u32_le(self.stake_time);
        encoder.write_u32_le(self.utxo.index);
        encoder.write_hash_le(&self.utxo.hash);
        encoder.write_u32_le(hashproof_timestamp);
        sha256d(&encoder.into_inner())
    }

    fn compute(&self, hashproof_timestamp: u32) -> (Hash256, bool) {
        let hash = self.stake_hash(hashproof_timestamp);
        let weight = (i64::from(hashproof_timestamp) - i64::from(self.stake_time))
            .min(MAXIMUM_COIN_AGE_WEIGHT_FOR_STAKING)
            .max(0);
        let coin_day_weight = U256::from(self.value.max(0) as u64) * U256::from(weight as u64)
            / U256::from(COIN as u64)
            / U256::from(400u64);
        let hit = match self.target_per_coin_day.checked_mul(coin_day_weight) {
            Some(target) => U256::from_little_endian(&hash) < target,
            // Only reachable with minimal difficulty: the target covers every hash.
            None => true,
        };
        (hash, hit)
    }
}

/// Kernel checks against the legacy modifier selection.
#[derive(Clone, Copy, Debug)]
pub struct KernelProofGenerator {
    minimum_coin_age: u32,
}

impl KernelProofGenerator {
    pub fn new(minimum_coin_age: u32) -> Self {
        Self { minimum_coin_age }
    }

    fn time_requirements_met(&self, stake_time: u32, hashproof_time: u32) -> Result<(), StakeError> {
        if hashproof_time < stake_time {
            return Err(StakeError::TimestampBeforeStake {
                stake_time,
                hashproof_time,
            });
        }
        if u64::from(stake_time) + u64::from(self.minimum_coin_age) > u64::from(hashproof_time) {
            return Err(StakeError::MinimumAgeNotMet {
                stake_time,
                hashproof_time,
            });
        }
        Ok(())
    }

    fn calculator(
        &self,
        source: &dyn StakeModifierSource,
        staking: &StakingData,
        initial_timestamp: u32,
    ) -> Result<ProofOfStakeCalculator, StakeError> {
        self.time_requirements_met(staking.block_time_of_first_confirmation, initial_timestamp)?;
        let modifier = kernel_stake_modifier(source, &staking.block_hash_of_first_confirmation)?;
        Ok(ProofOfStakeCalculator {
            utxo: staking.utxo_being_staked.clone(),
            value: staking.utxo_value,
            modifier,
            target_per_coin_day: compact_to_u256(staking.bits)?,
            stake_time: staking.block_time_of_first_confirmation,
        })
    }
}

impl ProofOfStakeGenerator for KernelProofGenerator {
    fn compute_and_verify_proof_of_stake(
        &self,
        source: &dyn StakeModifierSource,
        staking: &StakingData,
        hashproof_timestamp: u32,
    ) -> Result<Hash256, StakeError> {
        let calculator = self.calculator(source, staking, hashproof_timestamp)?;
        match calculator.compute(hashproof_timestamp) {
            (hash, true) => Ok(hash),
            (hash, false) => Err(StakeError::TargetMissed(hash)),
        }
    }

    fn create_hashproof_timestamp(
        &self,
        source: &dyn StakeModifierSource,
        staking: &StakingData,
        initial_timestamp: u32,
    ) -> HashproofCreationResult {
        let calculator = match self.calculator(source, staking, initial_timestamp) {
            Ok(calculator) => calculator,
            Err(err) => {
                stakd_log::log_debug!("hashproof setup failed: {err}");
                return HashproofCreationResult::FailedSetup;
            }
        };
        let mut timestamp = initial_timestamp;
        for _ in 0..HASH_DRIFT {
            if calculator.compute(timestamp).1 {
                return HashproofCreationResult::Success(timestamp);
            }
            timestamp = timestamp.saturating_sub(1);
        }
        HashproofCreationResult::FailedGeneration
    }

    fn compute_stake_modifier(
        &self,
        source: &dyn StakeModifierSource,
        prev: Option<&ModifierBlock>,
    ) -> Result<StakeModifier, StakeError> {
        compute_next_stake_modifier(source, prev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SingleBlock(ModifierBlock);

    impl StakeModifierSource for SingleBlock {
        fn block(&self, hash: &Hash256) -> Option<ModifierBlock> {
            (self.0.hash == *hash).then(|| self.0.clone())
        }

        fn active_block_at(&self, height: i32) -> Option<ModifierBlock> {
            (self.0.height == height).then(|| self.0.clone())
        }
    }

    fn source() -> SingleBlock {
        SingleBlock(ModifierBlock {
            hash: [9u8; 32],
            prev: None,
            height: 0,
            time: 1_000,
            proof_of_stake: false,
            modifier: StakeModifier {
                value: 0,
                generated: true,
            },
        })
    }

    fn staking(bits: u32) -> StakingData {
        StakingData {
            bits,
            block_time_of_first_confirmation: 1_000,
            block_hash_of_first_confirmation: [9u8; 32],
            utxo_being_staked: OutPoint::new([3u8; 32], 1),
            utxo_value: 1_000 * COIN,
            block_hash_of_chain_tip: [9u8; 32],
        }
    }

    #[test]
    fn easy_target_is_always_hit() {
        let generator = KernelProofGenerator::new(0);
        let proof = generator
            .compute_and_verify_proof_of_stake(&source(), &staking(0x207fffff), 5_000)
            .expect("kernel");
        assert_ne!(proof, [0u8; 32]);
        assert_eq!(
            generator.create_hashproof_timestamp(&source(), &staking(0x207fffff), 5_000),
            HashproofCreationResult::Success(5_000)
        );
    }

    #[test]
    fn hard_target_is_missed() {
        let generator = KernelProofGenerator::new(0);
        let err = generator
            .compute_and_verify_proof_of_stake(&source(), &staking(0x03000001), 5_000)
            .expect_err("target");
        assert!(matches!(err, StakeError::TargetMissed(_)));
        assert_eq!(
            generator.create_hashproof_timestamp(&source(), &staking(0x03000001), 5_000),
            HashproofCreationResult::FailedGeneration
        );
    }

    #[test]
    fn time_requirements() {
        let generator = KernelProofGenerator::new(3_600);
        assert!(matches!(
            generator.compute_and_verify_proof_of_stake(&source(), &staking(0x207fffff), 999),
            Err(StakeError::TimestampBeforeStake { .. })
        ));
        assert!(matches!(
            generator.compute_and_verify_proof_of_stake(&source(), &staking(0x207fffff), 4_000),
            Err(StakeError::MinimumAgeNotMet { .. })
        ));
        assert_eq!(
            generator.create_hashproof_timestamp(&source(), &staking(0x207fffff), 4_000),
            HashproofCreationResult::FailedSetup
        );
    }

    #[test]
    fn stake_hash_commits_to_outpoint_and_time() {
        let calculator = ProofOfStakeCalculator {
            utxo: OutPoint::new([1u8; 32], 0),
            value: COIN,
            modifier: 7,
            target_per_coin_day: U256::one(),
            stake_time: 100,
        };
        let base = calculator.stake_hash(200);
        assert_ne!(base, calculator.stake_hash(201));
        let other = ProofOfStakeCalculator {
            utxo: OutPoint::new([1u8; 32], 1),
            ..calculator
        };
        assert_ne!(base, other.stake_hash(200));
    }
}
