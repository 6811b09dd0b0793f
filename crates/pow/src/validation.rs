use primitive_types::U256;
use stakd_consensus::{ChainParams, Hash256};

use crate::difficulty::{compact_to_u256, CompactError};

#[derive(Debug)]
pub enum PowError {
    InvalidBits(&'static str),
    HashMismatch,
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::InvalidBits(message) => write!(f, "{message}"),
            PowError::HashMismatch => write!(f, "pow hash does not meet target"),
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

/// Checks that `hash` satisfies `bits` and that `bits` is no easier than the pow limit.
pub fn check_proof_of_work(
    hash: &Hash256,
    bits: u32,
    params: &ChainParams,
) -> Result<(), PowError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Err(PowError::InvalidBits("pow target is zero"));
    }

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if target > pow_limit {
        return Err(PowError::InvalidBits("pow target above limit"));
    }

    let hash_value = U256::from_little_endian(hash);
    if hash_value > target {
        return Err(PowError::HashMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stakd_consensus::{chain_params, Network};

    #[test]
    fn rejects_target_above_limit() {
        let params = chain_params(Network::Mainnet);
        let err = check_proof_of_work(&[0u8; 32], 0x207f_ffff, &params).expect_err("too easy");
        assert!(matches!(err, PowError::InvalidBits(_)));
    }

    #[test]
    fn rejects_hash_above_target() {
        let params = chain_params(Network::Regtest);
        let err = check_proof_of_work(&[0xff; 32], 0x207f_ffff, &params).expect_err("high hash");
        assert!(matches!(err, PowError::HashMismatch));
        check_proof_of_work(&[0x01; 32], 0x207f_ffff, &params).expect("low hash");
    }

    #[test]
    fn rejects_negative_compact() {
        let params = chain_params(Network::Regtest);
        let err = check_proof_of_work(&[0u8; 32], 0x0480_0001, &params).expect_err("negative");
        assert!(matches!(err, PowError::Compact(CompactError::Negative)));
    }
}
