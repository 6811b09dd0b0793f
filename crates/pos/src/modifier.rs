//! Stake modifier selection.
//!
//! A new modifier is generated at most once per `MODIFIER_INTERVAL` seconds from one
//! entropy bit of each of 64 blocks selected out of the preceding selection window.

use std::collections::HashSet;

use primitive_types::U256;
use stakd_consensus::Hash256;
use stakd_primitives::encoding::Encoder;
use stakd_primitives::hash::sha256d;

use crate::kernel::StakeError;

pub const MODIFIER_INTERVAL: i64 = 60;
pub const MODIFIER_INTERVAL_RATIO: i64 = 3;
const SELECTION_ROUNDS: usize = 64;

/// Modifier handed to the first block after genesis.
pub const FIRST_BLOCK_MODIFIER: u64 = u64::from_le_bytes(*b"stakemod");

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StakeModifier {
    pub value: u64,
    /// True when this block produced a new modifier rather than inheriting one.
    pub generated: bool,
}

/// The block index facts modifier selection reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModifierBlock {
    pub hash: Hash256,
    pub prev: Option<Hash256>,
    pub height: i32,
    pub time: i64,
    pub proof_of_stake: bool,
    pub modifier: StakeModifier,
}

impl ModifierBlock {
    pub fn entropy_bit(&self) -> u64 {
        u64::from(self.hash[0] & 1)
    }
}

pub trait StakeModifierSource {
    fn block(&self, hash: &Hash256) -> Option<ModifierBlock>;
    /// Block at `height` on the active chain.
    fn active_block_at(&self, height: i32) -> Option<ModifierBlock>;
}

pub fn selection_interval_section(section: usize) -> i64 {
    let section = section as i64;
    MODIFIER_INTERVAL * 63 / (63 + ((63 - section) * (MODIFIER_INTERVAL_RATIO - 1)))
}

pub fn selection_interval() -> i64 {
    (0..SELECTION_ROUNDS).map(selection_interval_section).sum()
}

fn last_stake_modifier(
    source: &dyn StakeModifierSource,
    start: &ModifierBlock,
) -> Result<(u64, i64), StakeError> {
    let mut current = start.clone();
    while !current.modifier.generated {
        let Some(prev_hash) = current.prev else {
            break;
        };
        current = source
            .block(&prev_hash)
            .ok_or(StakeError::ModifierUnavailable("ancestor missing from index"))?;
    }
    if !current.modifier.generated {
        return Err(StakeError::ModifierUnavailable("no modifier generated at genesis"));
    }
    Ok((current.modifier.value, current.time))
}

fn selection_hash(block: &ModifierBlock, previous_modifier: u64) -> U256 {
    let proof = if block.proof_of_stake {
        [0u8; 32]
    } else {
        block.hash
    };
    let mut encoder = Encoder::with_capacity(40);
    encoder.write_hash_le(&proof);
    encoder.write_u64_le(previous_modifier);
    let hash = U256::from_little_endian(&sha256d(&encoder.into_inner()));
    if block.proof_of_stake {
        hash >> 32
    } else {
        hash
    }
}

fn select_block_from_candidates(
    candidates: &[ModifierBlock],
    selected: &HashSet<Hash256>,
    interval_stop: i64,
    previous_modifier: u64,
) -> Option<usize> {
    let mut best: Option<(U256, usize)> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        if best.is_some() && candidate.time > interval_stop {
            break;
        }
        if selected.contains(&candidate.hash) {
            continue;
        }
        let hash = selection_hash(candidate, previous_modifier);
        match best {
            Some((best_hash, _)) if hash >= best_hash => {}
            _ => best = Some((hash, index)),
        }
    }
    best.map(|(_, index)| index)
}

/// Modifier for the block following `prev`; `None` means the block is genesis.
pub fn compute_next_stake_modifier(
    source: &dyn StakeModifierSource,
    prev: Option<&ModifierBlock>,
) -> Result<StakeModifier, StakeError> {
    let Some(prev) = prev else {
        return Ok(StakeModifier {
            value: 0,
            generated: true,
        });
    };
    if prev.height == 0 {
        return Ok(StakeModifier {
            value: FIRST_BLOCK_MODIFIER,
            generated: true,
        });
    }

    let (current_modifier, modifier_time) = last_stake_modifier(source, prev)?;
    if modifier_time / MODIFIER_INTERVAL >= prev.time / MODIFIER_INTERVAL {
        return Ok(StakeModifier {
            value: current_modifier,
            generated: false,
        });
    }

    let interval_start = (prev.time / MODIFIER_INTERVAL) * MODIFIER_INTERVAL - selection_interval();
    let mut candidates = Vec::new();
    let mut cursor = Some(prev.clone());
    while let Some(block) = cursor {
        if block.time < interval_start {
            break;
        }
        cursor = match block.prev {
            Some(prev_hash) => Some(
                source
                    .block(&prev_hash)
                    .ok_or(StakeError::ModifierUnavailable("ancestor missing from index"))?,
            ),
            None => None,
        };
        candidates.push(block);
    }
    candidates.reverse();
    candidates.sort_by(|a, b| {
        a.time
            .cmp(&b.time)
            .then_with(|| U256::from_little_endian(&a.hash).cmp(&U256::from_little_endian(&b.hash)))
    });

    let mut new_modifier = 0u64;
    let mut interval_stop = interval_start;
    let mut selected = HashSet::new();
    for round in 0..SELECTION_ROUNDS.min(candidates.len()) {
        interval_stop += selection_interval_section(round);
        let index = select_block_from_candidates(&candidates, &selected, interval_stop, current_modifier)
            .ok_or(StakeError::ModifierUnavailable("no candidate selected"))?;
        let chosen = &candidates[index];
        new_modifier |= chosen.entropy_bit() << round;
        selected.insert(chosen.hash);
    }

    stakd_log::log_trace!(
        "stake modifier for height {}: {:016x} from {} candidates",
        prev.height + 1,
        new_modifier,
        candidates.len()
    );
    Ok(StakeModifier {
        value: new_modifier,
        generated: true,
    })
}

/// Modifier a kernel must hash with: the one generated about one selection interval
/// after the block that confirmed the staked output.
pub fn kernel_stake_modifier(
    source: &dyn StakeModifierSource,
    block_from: &Hash256,
) -> Result<u64, StakeError> {
    let from = source
        .block(block_from)
        .ok_or(StakeError::ModifierUnavailable("block not indexed"))?;
    let interval = selection_interval();
    let mut selected_time = from.time;
    let mut current = from.clone();
    let mut next = source.active_block_at(from.height + 1);

    while selected_time < from.time + interval {
        let Some(block) = next else {
            return Ok(if current.modifier.generated {
                current.modifier.value
            } else {
                0
            });
        };
        next = source.active_block_at(block.height + 1);
        if block.modifier.generated {
            selected_time = block.time;
        }
        current = block;
    }
    Ok(current.modifier.value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Chain {
        blocks: Vec<ModifierBlock>,
    }

    impl Chain {
        fn new(times: &[i64]) -> Self {
            let mut blocks: Vec<ModifierBlock> = Vec::new();
            for (height, time) in times.iter().enumerate() {
                let mut hash = [0u8; 32];
                hash[0] = height as u8;
                hash[1] = 0xaa;
                blocks.push(ModifierBlock {
                    hash,
                    prev: blocks.last().map(|b| b.hash),
                    height: height as i32,
                    time: *time,
                    proof_of_stake: height > 1,
                    modifier: StakeModifier::default(),
                });
            }
            let mut chain = Self { blocks };
            for height in 0..chain.blocks.len() {
                let prev = height.checked_sub(1).map(|h| chain.blocks[h].clone());
                let modifier =
                    compute_next_stake_modifier(&chain, prev.as_ref()).expect("modifier");
                chain.blocks[height].modifier = modifier;
            }
            chain
        }
    }

    impl StakeModifierSource for Chain {
        fn block(&self, hash: &Hash256) -> Option<ModifierBlock> {
            let by_hash: HashMap<_, _> = self.blocks.iter().map(|b| (b.hash, b)).collect();
            by_hash.get(hash).map(|b| (*b).clone())
        }

        fn active_block_at(&self, height: i32) -> Option<ModifierBlock> {
            usize::try_from(height)
                .ok()
                .and_then(|h| self.blocks.get(h))
                .cloned()
        }
    }

    #[test]
    fn genesis_and_first_block_modifiers() {
        let chain = Chain::new(&[1_000, 1_060]);
        assert_eq!(
            chain.blocks[0].modifier,
            StakeModifier {
                value: 0,
                generated: true
            }
        );
        assert_eq!(chain.blocks[1].modifier.value, FIRST_BLOCK_MODIFIER);
    }

    #[test]
    fn modifier_regenerates_once_per_interval() {
        let chain = Chain::new(&[1_000, 1_060, 1_070, 1_080, 1_200]);
        // Block 2 follows a block generated in the same minute.
        assert!(!chain.blocks[2].modifier.generated);
        assert_eq!(chain.blocks[2].modifier.value, FIRST_BLOCK_MODIFIER);
        assert!(chain.blocks[4].modifier.generated);
    }

    #[test]
    fn selection_interval_matches_sections() {
        assert_eq!(selection_interval_section(63), MODIFIER_INTERVAL);
        assert_eq!(selection_interval_section(0), MODIFIER_INTERVAL * 63 / 189);
        assert!(selection_interval() > 0);
    }

    #[test]
    fn kernel_modifier_uses_last_generated_at_chain_end() {
        let chain = Chain::new(&[1_000, 1_060, 1_130, 1_200]);
        assert!(!chain.blocks[2].modifier.generated);
        assert!(chain.blocks[3].modifier.generated);
        let modifier = kernel_stake_modifier(&chain, &chain.blocks[1].hash).expect("modifier");
        assert_eq!(modifier, chain.blocks[3].modifier.value);

        let short = Chain::new(&[1_000, 1_060, 1_070]);
        assert_eq!(kernel_stake_modifier(&short, &short.blocks[1].hash).expect("modifier"), 0);
    }
}
