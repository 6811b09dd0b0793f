//! Merkle root computation with mutation detection.
//!
//! The tree duplicates the last hash of an odd-length level. That makes
//! `[a, b, c]` and `[a, b, c, c]` share a root, so a block with a repeated
//! transaction tail can be forged under a valid header hash. Any level that
//! pairs two identical hashes is reported as mutated.

use stakd_consensus::Hash256;

use crate::block::Block;
use crate::hash::sha256d;

/// Returns `(root, mutated)`. An empty list hashes to all zeroes.
pub fn merkle_root(leaves: &[Hash256]) -> (Hash256, bool) {
    if leaves.is_empty() {
        return ([0u8; 32], false);
    }

    let mut mutated = false;
    let mut level: Vec<Hash256> = leaves.to_vec();
    while level.len() > 1 {
        for pair in level.chunks_exact(2) {
            if pair[0] == pair[1] {
                mutated = true;
            }
        }
        if level.len() % 2 == 1 {
            let last = level[level.len() - 1];
            level.push(last);
        }
        level = level
            .chunks_exact(2)
            .map(|pair| {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&pair[0]);
                buf[32..].copy_from_slice(&pair[1]);
                sha256d(&buf)
            })
            .collect();
    }

    (level[0], mutated)
}

pub fn block_merkle_root(block: &Block) -> (Hash256, bool) {
    merkle_root(&block.txids())
}
