//! In-memory block index: an arena of nodes linked by parent and skip pointers.

use std::collections::{BTreeSet, HashMap};

use primitive_types::U256;
use stakd_consensus::constants::MEDIAN_TIME_SPAN;
use stakd_consensus::Hash256;
use stakd_pos::{ModifierBlock, StakeModifier};
use stakd_pow::{block_proof, HeaderInfo};
use stakd_primitives::block::BlockHeader;
use stakd_primitives::encoding::{DecodeError, Decoder, Encoder};

use crate::flatfiles::FileLocation;

pub const BLOCK_VALID_UNKNOWN: u32 = 0;
pub const BLOCK_VALID_HEADER: u32 = 1;
pub const BLOCK_VALID_TREE: u32 = 2;
pub const BLOCK_VALID_TRANSACTIONS: u32 = 3;
pub const BLOCK_VALID_CHAIN: u32 = 4;
pub const BLOCK_VALID_SCRIPTS: u32 = 5;
pub const BLOCK_VALID_MASK: u32 = 7;
pub const BLOCK_HAVE_DATA: u32 = 8;
pub const BLOCK_HAVE_UNDO: u32 = 16;
pub const BLOCK_FAILED_VALID: u32 = 32;
pub const BLOCK_FAILED_CHILD: u32 = 64;
pub const BLOCK_FAILED_MASK: u32 = BLOCK_FAILED_VALID | BLOCK_FAILED_CHILD;

const RECORD_VERSION: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug)]
pub struct BlockIndexNode {
    pub hash: Hash256,
    pub prev: Option<NodeId>,
    pub skip: Option<NodeId>,
    pub height: i32,
    pub version: i32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub chain_work: U256,
    pub status: u32,
    pub tx_count: u32,
    /// Transactions in this block and all ancestors; zero until every ancestor has data.
    pub chain_tx: u64,
    /// Arrival order of full data, used to break work ties. Zero for blocks loaded from disk.
    pub sequence_id: u64,
    pub data_pos: Option<FileLocation>,
    pub proof_of_stake: bool,
    pub stake_modifier: StakeModifier,
    pub hash_proof: Hash256,
}

impl BlockIndexNode {
    pub fn validity(&self) -> u32 {
        self.status & BLOCK_VALID_MASK
    }

    /// False when failed; otherwise whether validity has reached `level`.
    pub fn is_valid(&self, level: u32) -> bool {
        if self.failed() {
            return false;
        }
        self.validity() >= level
    }

    /// Raises validity to `level`; returns true when it changed.
    pub fn raise_validity(&mut self, level: u32) -> bool {
        if self.failed() {
            return false;
        }
        if self.validity() < level {
            self.status = (self.status & !BLOCK_VALID_MASK) | level;
            return true;
        }
        false
    }

    pub fn have_data(&self) -> bool {
        self.status & BLOCK_HAVE_DATA != 0
    }

    pub fn failed(&self) -> bool {
        self.status & BLOCK_FAILED_MASK != 0
    }

    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_block: self.prev_hash,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }

    pub fn header_info(&self) -> HeaderInfo {
        HeaderInfo {
            height: i64::from(self.height),
            time: i64::from(self.time),
            bits: self.bits,
        }
    }

    fn encode_record(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(200);
        encoder.write_u8(RECORD_VERSION);
        encoder.write_i32_le(self.height);
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_hash);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
        encoder.write_u32_le(self.status);
        encoder.write_u32_le(self.tx_count);
        match self.data_pos {
            Some(location) => {
                encoder.write_u8(1);
                encoder.write_bytes(&location.encode());
            }
            None => encoder.write_u8(0),
        }
        encoder.write_u8(u8::from(self.proof_of_stake));
        encoder.write_u64_le(self.stake_modifier.value);
        encoder.write_u8(u8::from(self.stake_modifier.generated));
        encoder.write_hash_le(&self.hash_proof);
        encoder.into_inner()
    }
}

/// A block index entry as persisted in `Column::BlockIndex`, keyed by block hash.
///
/// Derived fields (links, chain work, chain tx count, sequence id) are not stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredBlockIndex {
    pub hash: Hash256,
    pub height: i32,
    pub header: BlockHeader,
    pub status: u32,
    pub tx_count: u32,
    pub data_pos: Option<FileLocation>,
    pub proof_of_stake: bool,
    pub stake_modifier: StakeModifier,
    pub hash_proof: Hash256,
}

impl StoredBlockIndex {
    pub fn decode(hash: Hash256, bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        if decoder.read_u8()? != RECORD_VERSION {
            return Err(DecodeError::InvalidData("unknown block index record version"));
        }
        let height = decoder.read_i32_le()?;
        let header = BlockHeader {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash_le()?,
            merkle_root: decoder.read_hash_le()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        };
        let status = decoder.read_u32_le()?;
        let tx_count = decoder.read_u32_le()?;
        let data_pos = match decoder.read_u8()? {
            0 => None,
            1 => {
                let raw = decoder.read_fixed::<{ FileLocation::ENCODED_LEN }>()?;
                Some(
                    FileLocation::decode(&raw)
                        .ok_or(DecodeError::InvalidData("bad block file location"))?,
                )
            }
            _ => return Err(DecodeError::InvalidData("bad data position flag")),
        };
        let proof_of_stake = decoder.read_u8()? != 0;
        let stake_modifier = StakeModifier {
            value: decoder.read_u64_le()?,
            generated: decoder.read_u8()? != 0,
        };
        let hash_proof = decoder.read_hash_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            hash,
            height,
            header,
            status,
            tx_count,
            data_pos,
            proof_of_stake,
            stake_modifier,
            hash_proof,
        })
    }
}

fn invert_lowest_one(value: i32) -> i32 {
    value & value.saturating_sub(1)
}

/// Height the skip pointer of a block at `height` points to.
fn get_skip_height(height: i32) -> i32 {
    if height < 2 {
        0
    } else if (height & 1) != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

#[derive(Debug, Default)]
pub struct BlockIndexGraph {
    nodes: Vec<BlockIndexNode>,
    by_hash: HashMap<Hash256, NodeId>,
    dirty: BTreeSet<NodeId>,
    best_header: Option<NodeId>,
}

impl BlockIndexGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> &BlockIndexNode {
        &self.nodes[id.index()]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut BlockIndexNode {
        &mut self.nodes[id.index()]
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<NodeId> {
        self.by_hash.get(hash).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    pub fn best_header(&self) -> Option<NodeId> {
        self.best_header
    }

    pub fn mark_dirty(&mut self, id: NodeId) {
        self.dirty.insert(id);
    }

    pub fn take_dirty(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.dirty).into_iter().collect()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Serialized record for `id`, keyed by its hash in `Column::BlockIndex`.
    pub fn record(&self, id: NodeId) -> (Hash256, Vec<u8>) {
        let node = self.get(id);
        (node.hash, node.encode_record())
    }

    /// Adds a header whose parent is `prev` and marks it tree-valid and dirty.
    pub fn insert_header(&mut self, header: &BlockHeader, prev: Option<NodeId>) -> NodeId {
        let hash = header.hash();
        if let Some(existing) = self.lookup(&hash) {
            return existing;
        }
        let id = self.push(StoredBlockIndex {
            hash,
            height: prev.map_or(0, |prev| self.get(prev).height + 1),
            header: header.clone(),
            status: BLOCK_VALID_UNKNOWN,
            tx_count: 0,
            data_pos: None,
            proof_of_stake: false,
            stake_modifier: StakeModifier::default(),
            hash_proof: [0u8; 32],
        }, prev);
        self.get_mut(id).raise_validity(BLOCK_VALID_TREE);
        self.dirty.insert(id);
        id
    }

    /// Adds a persisted entry. Parents must be inserted before their children.
    pub fn insert_stored(&mut self, stored: StoredBlockIndex) -> NodeId {
        if let Some(existing) = self.lookup(&stored.hash) {
            return existing;
        }
        let prev = self.lookup(&stored.header.prev_block);
        self.push(stored, prev)
    }

    fn push(&mut self, stored: StoredBlockIndex, prev: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        let proof = block_proof(stored.header.bits).unwrap_or_default();
        let (height, chain_work) = match prev {
            Some(prev) => {
                let parent = self.get(prev);
                (parent.height + 1, parent.chain_work.saturating_add(proof))
            }
            None => (stored.height, proof),
        };
        let skip = prev.and_then(|prev| self.ancestor(prev, get_skip_height(height)));
        self.nodes.push(BlockIndexNode {
            hash: stored.hash,
            prev,
            skip,
            height,
            version: stored.header.version,
            prev_hash: stored.header.prev_block,
            merkle_root: stored.header.merkle_root,
            time: stored.header.time,
            bits: stored.header.bits,
            nonce: stored.header.nonce,
            chain_work,
            status: stored.status,
            tx_count: stored.tx_count,
            chain_tx: 0,
            sequence_id: 0,
            data_pos: stored.data_pos,
            proof_of_stake: stored.proof_of_stake,
            stake_modifier: stored.stake_modifier,
            hash_proof: stored.hash_proof,
        });
        self.by_hash.insert(stored.hash, id);
        let more_work = match self.best_header {
            Some(best) => self.get(best).chain_work < chain_work,
            None => true,
        };
        if more_work {
            self.best_header = Some(id);
        }
        id
    }

    /// Ancestor of `id` at `height`, following skip pointers.
    pub fn ancestor(&self, id: NodeId, height: i32) -> Option<NodeId> {
        let mut walk = id;
        let mut walk_height = self.get(id).height;
        if height > walk_height || height < 0 {
            return None;
        }
        while walk_height > height {
            let skip_height = get_skip_height(walk_height);
            let skip_height_prev = get_skip_height(walk_height - 1);
            let node = self.get(walk);
            match node.skip {
                Some(skip)
                    if skip_height == height
                        || (skip_height > height
                            && !(skip_height_prev < skip_height - 2
                                && skip_height_prev >= height)) =>
                {
                    walk = skip;
                    walk_height = skip_height;
                }
                _ => {
                    walk = node.prev?;
                    walk_height -= 1;
                }
            }
        }
        Some(walk)
    }

    pub fn median_time_past(&self, id: NodeId) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            let node = self.get(current);
            times.push(i64::from(node.time));
            cursor = node.prev;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Up to `count` headers ending at `id`, oldest first.
    pub fn header_infos(&self, id: NodeId, count: usize) -> Vec<HeaderInfo> {
        let mut infos = Vec::with_capacity(count);
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if infos.len() == count {
                break;
            }
            let node = self.get(current);
            infos.push(node.header_info());
            cursor = node.prev;
        }
        infos.reverse();
        infos
    }

    pub fn modifier_block(&self, id: NodeId) -> ModifierBlock {
        let node = self.get(id);
        ModifierBlock {
            hash: node.hash,
            prev: node.prev.map(|prev| self.get(prev).hash),
            height: node.height,
            time: i64::from(node.time),
            proof_of_stake: node.proof_of_stake,
            modifier: node.stake_modifier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(prev: Hash256, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time: 1_000 + nonce,
            bits: 0x207fffff,
            nonce,
        }
    }

    fn linear(graph: &mut BlockIndexGraph, len: u32) -> Vec<NodeId> {
        let mut ids = Vec::new();
        let mut prev_hash = [0u8; 32];
        let mut prev = None;
        for nonce in 0..len {
            let header = header(prev_hash, nonce);
            let id = graph.insert_header(&header, prev);
            prev_hash = header.hash();
            prev = Some(id);
            ids.push(id);
        }
        ids
    }

    #[test]
    fn ancestors_via_skip_list() {
        let mut graph = BlockIndexGraph::new();
        let ids = linear(&mut graph, 300);
        for (height, id) in ids.iter().enumerate() {
            assert_eq!(graph.get(*id).height, height as i32);
        }
        for target in [0, 1, 2, 17, 128, 255, 298, 299] {
            assert_eq!(graph.ancestor(ids[299], target), Some(ids[target as usize]));
        }
        assert_eq!(graph.ancestor(ids[10], 11), None);
        for id in &ids[2..] {
            let node = graph.get(*id);
            let skip = node.skip.expect("skip");
            assert!(graph.get(skip).height < node.height);
        }
    }

    #[test]
    fn work_accumulates_and_best_header_tracks_it() {
        let mut graph = BlockIndexGraph::new();
        let ids = linear(&mut graph, 5);
        for pair in ids.windows(2) {
            assert!(graph.get(pair[1]).chain_work > graph.get(pair[0]).chain_work);
        }
        assert_eq!(graph.best_header(), Some(ids[4]));
        assert_eq!(graph.take_dirty().len(), 5);
        assert_eq!(graph.dirty_count(), 0);
    }

    #[test]
    fn median_time_of_last_eleven() {
        let mut graph = BlockIndexGraph::new();
        let ids = linear(&mut graph, 20);
        // times are 1000 + height; the window is heights 9..=19
        assert_eq!(graph.median_time_past(ids[19]), 1_014);
        assert_eq!(graph.median_time_past(ids[0]), 1_000);
    }

    #[test]
    fn stored_record_survives_encoding() {
        let mut graph = BlockIndexGraph::new();
        let ids = linear(&mut graph, 2);
        {
            let node = graph.get_mut(ids[1]);
            node.status |= BLOCK_HAVE_DATA;
            node.tx_count = 3;
            node.data_pos = Some(FileLocation {
                file_id: 2,
                offset: 99,
                len: 500,
            });
            node.stake_modifier = StakeModifier {
                value: 42,
                generated: true,
            };
        }
        let (hash, bytes) = graph.record(ids[1]);
        let stored = StoredBlockIndex::decode(hash, &bytes).expect("decode");
        assert_eq!(stored.height, 1);
        assert_eq!(stored.tx_count, 3);
        assert_eq!(stored.data_pos.map(|pos| pos.offset), Some(99));
        assert_eq!(stored.stake_modifier.value, 42);
        assert_eq!(stored.header.hash(), hash);
        assert!(StoredBlockIndex::decode(hash, &bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn failed_nodes_are_never_valid() {
        let mut graph = BlockIndexGraph::new();
        let ids = linear(&mut graph, 1);
        let node = graph.get_mut(ids[0]);
        assert!(node.is_valid(BLOCK_VALID_TREE));
        node.status |= BLOCK_FAILED_CHILD;
        assert!(!node.is_valid(BLOCK_VALID_HEADER));
        assert!(!node.raise_validity(BLOCK_VALID_SCRIPTS));
    }
}
