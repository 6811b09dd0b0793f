//! Difficulty and compact target utilities.

use primitive_types::U256;
use stakd_consensus::{ChainParams, Hash256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    NonContiguous,
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::NonContiguous => write!(f, "header list must be contiguous by height"),
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

/// The slice of an ancestor chain the retarget needs: height, timestamp and bits.
#[derive(Clone, Copy, Debug)]
pub struct HeaderInfo {
    pub height: i64,
    pub time: i64,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    let value = compact_to_u256(bits)?;
    Ok(u256_to_hash(value))
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    let value = U256::from_little_endian(target);
    u256_to_compact(value)
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    let hash_value = U256::from_little_endian(hash);
    let target_value = U256::from_little_endian(target);
    hash_value <= target_value
}

pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

/// Bits required for the block after the last entry of `chain`.
///
/// `chain` must be contiguous and end at the previous block; the retarget looks at
/// most `dgw_past_blocks` entries back. Proof-of-work heights use DarkGravity v3,
/// heights past `last_pow_height` use the per-block stake retarget.
pub fn get_next_work_required(
    chain: &[HeaderInfo],
    params: &ChainParams,
) -> Result<u32, DifficultyError> {
    let pow_limit = U256::from_little_endian(&params.pow_limit);
    let Some(last) = chain.last() else {
        return Ok(u256_to_compact(pow_limit));
    };
    ensure_contiguous(chain)?;

    if last.height == 0 || last.height < params.dgw_past_blocks {
        return Ok(u256_to_compact(pow_limit));
    }
    if params.pow_no_retargeting {
        return Ok(last.bits);
    }

    if last.height > i64::from(params.last_pow_height) {
        let prev_time = chain
            .len()
            .checked_sub(2)
            .map(|idx| chain[idx].time)
            .unwrap_or(last.time);
        return stake_next_work_required(last, prev_time, params);
    }

    dark_gravity_next_work_required(chain, params)
}

fn stake_next_work_required(
    last: &HeaderInfo,
    prev_time: i64,
    params: &ChainParams,
) -> Result<u32, DifficultyError> {
    let target_limit = U256::from_little_endian(&params.pos_limit);
    let spacing = params.pos_target_spacing;
    let interval = params.pos_interval();

    let mut actual_spacing = last.time - prev_time;
    if actual_spacing < 0 {
        actual_spacing = 1;
    }

    let mut next = compact_to_u256(last.bits)?;
    let numerator = (interval - 1) * spacing + actual_spacing + actual_spacing;
    let denominator = (interval + 1) * spacing;
    next = next.overflowing_mul(U256::from(numerator as u64)).0;
    next /= U256::from(denominator as u64);

    if next.is_zero() || next > target_limit {
        next = target_limit;
    }
    Ok(u256_to_compact(next))
}

fn dark_gravity_next_work_required(
    chain: &[HeaderInfo],
    params: &ChainParams,
) -> Result<u32, DifficultyError> {
    let past_blocks = params.dgw_past_blocks;
    let mut count_blocks: i64 = 0;
    let mut actual_timespan: i64 = 0;
    let mut last_block_time: i64 = 0;
    let mut average = U256::zero();

    for reading in chain.iter().rev() {
        if reading.height <= 0 || count_blocks >= past_blocks {
            break;
        }
        count_blocks += 1;

        let target = compact_to_u256(reading.bits)?;
        average = if count_blocks == 1 {
            target
        } else {
            (average * U256::from(count_blocks as u64) + target)
                / U256::from((count_blocks + 1) as u64)
        };

        if last_block_time > 0 {
            actual_timespan += last_block_time - reading.time;
        }
        last_block_time = reading.time;
    }

    let target_timespan = count_blocks * params.pow_target_spacing;
    actual_timespan = actual_timespan.clamp(target_timespan / 3, target_timespan * 3);

    let mut next = average
        .overflowing_mul(U256::from(actual_timespan.max(0) as u64))
        .0;
    next /= U256::from(target_timespan.max(1) as u64);

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if next > pow_limit {
        next = pow_limit;
    }
    Ok(u256_to_compact(next))
}

fn u256_to_hash(value: U256) -> Hash256 {
    value.to_little_endian()
}

fn ensure_contiguous(chain: &[HeaderInfo]) -> Result<(), DifficultyError> {
    let base = chain[0].height;
    for (idx, header) in chain.iter().enumerate() {
        if header.height != base + idx as i64 {
            return Err(DifficultyError::NonContiguous);
        }
    }
    Ok(())
}
