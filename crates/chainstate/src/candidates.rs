//! Tip candidates ordered by work, and blocks waiting on a parent's data.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use primitive_types::U256;

use crate::blockindex::{BlockIndexGraph, NodeId};

/// Sort key where a greater key is a better tip: more work, then earlier arrival,
/// then earlier insertion into the index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CandidateKey {
    pub work: U256,
    pub sequence_id: u64,
    pub id: NodeId,
}

impl CandidateKey {
    pub fn of(graph: &BlockIndexGraph, id: NodeId) -> Self {
        let node = graph.get(id);
        Self {
            work: node.chain_work,
            sequence_id: node.sequence_id,
            id,
        }
    }
}

impl Ord for CandidateKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.work
            .cmp(&other.work)
            .then_with(|| other.sequence_id.cmp(&self.sequence_id))
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for CandidateKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// True when `a` ranks below `b` as a tip.
pub fn is_worse(graph: &BlockIndexGraph, a: NodeId, b: NodeId) -> bool {
    CandidateKey::of(graph, a) < CandidateKey::of(graph, b)
}

#[derive(Debug, Default)]
pub struct CandidateSet {
    ordered: BTreeSet<CandidateKey>,
    keys: HashMap<NodeId, CandidateKey>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.keys.contains_key(&id)
    }

    /// Inserts `id` keyed by its current work and sequence id.
    pub fn insert(&mut self, graph: &BlockIndexGraph, id: NodeId) {
        let key = CandidateKey::of(graph, id);
        if let Some(old) = self.keys.insert(id, key) {
            self.ordered.remove(&old);
        }
        self.ordered.insert(key);
    }

    pub fn remove(&mut self, id: NodeId) -> bool {
        match self.keys.remove(&id) {
            Some(key) => {
                self.ordered.remove(&key);
                true
            }
            None => false,
        }
    }

    pub fn best(&self) -> Option<NodeId> {
        self.ordered.last().map(|key| key.id)
    }

    /// Drops every candidate that ranks below `tip`.
    pub fn prune_worse_than(&mut self, graph: &BlockIndexGraph, tip: NodeId) {
        let tip_key = CandidateKey::of(graph, tip);
        let kept = self.ordered.split_off(&tip_key);
        for key in std::mem::replace(&mut self.ordered, kept) {
            self.keys.remove(&key.id);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.ordered.iter().rev().map(|key| key.id)
    }
}

/// Children with data whose parent's data has not arrived, keyed by parent.
#[derive(Debug, Default)]
pub struct UnlinkedBlocks {
    by_parent: HashMap<NodeId, Vec<NodeId>>,
}

impl UnlinkedBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, parent: NodeId, child: NodeId) {
        let children = self.by_parent.entry(parent).or_default();
        if !children.contains(&child) {
            children.push(child);
        }
    }

    pub fn take(&mut self, parent: NodeId) -> Vec<NodeId> {
        self.by_parent.remove(&parent).unwrap_or_default()
    }

    pub fn contains(&self, parent: NodeId, child: NodeId) -> bool {
        self.by_parent
            .get(&parent)
            .is_some_and(|children| children.contains(&child))
    }

    pub fn contains_child(&self, child: NodeId) -> bool {
        self.by_parent
            .values()
            .any(|children| children.contains(&child))
    }

    pub fn len(&self) -> usize {
        self.by_parent.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_parent.is_empty()
    }
}
