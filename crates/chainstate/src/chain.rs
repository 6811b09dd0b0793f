//! The active chain as a height-indexed vector of block index nodes.

use crate::blockindex::{BlockIndexGraph, NodeId};

#[derive(Clone, Debug, Default)]
pub struct ChainView {
    blocks: Vec<NodeId>,
}

impl ChainView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tip(&self) -> Option<NodeId> {
        self.blocks.last().copied()
    }

    pub fn genesis(&self) -> Option<NodeId> {
        self.blocks.first().copied()
    }

    /// Height of the tip, -1 when empty.
    pub fn height(&self) -> i32 {
        self.blocks.len() as i32 - 1
    }

    pub fn at(&self, height: i32) -> Option<NodeId> {
        usize::try_from(height)
            .ok()
            .and_then(|height| self.blocks.get(height).copied())
    }

    pub fn contains(&self, graph: &BlockIndexGraph, id: NodeId) -> bool {
        self.at(graph.get(id).height) == Some(id)
    }

    /// Successor of `id` on this chain.
    pub fn next(&self, graph: &BlockIndexGraph, id: NodeId) -> Option<NodeId> {
        if !self.contains(graph, id) {
            return None;
        }
        self.at(graph.get(id).height + 1)
    }

    /// Makes `tip` the chain tip, rewriting only the heights that differ.
    pub fn set_tip(&mut self, graph: &BlockIndexGraph, tip: Option<NodeId>) {
        let Some(tip) = tip else {
            self.blocks.clear();
            return;
        };
        let height = graph.get(tip).height as usize;
        self.blocks.resize(height + 1, tip);
        let mut cursor = Some(tip);
        while let Some(id) = cursor {
            let node = graph.get(id);
            let slot = node.height as usize;
            if self.blocks[slot] == id && slot != height {
                break;
            }
            self.blocks[slot] = id;
            cursor = node.prev;
        }
    }

    /// Last block shared by this chain and the ancestry of `id`.
    pub fn find_fork(&self, graph: &BlockIndexGraph, id: NodeId) -> Option<NodeId> {
        let mut cursor = if graph.get(id).height > self.height() {
            graph.ancestor(id, self.height())
        } else {
            Some(id)
        };
        while let Some(current) = cursor {
            if self.contains(graph, current) {
                return Some(current);
            }
            cursor = graph.get(current).prev;
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.blocks.iter().copied()
    }
}
