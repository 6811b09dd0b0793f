//! Best-chain selection over the candidate set and the block index consistency check.

use std::collections::HashMap;

use stakd_consensus::{hash256_to_hex, Hash256};

use crate::blockindex::{
    NodeId, BLOCK_FAILED_CHILD, BLOCK_FAILED_VALID, BLOCK_VALID_CHAIN, BLOCK_VALID_SCRIPTS,
    BLOCK_VALID_TRANSACTIONS, BLOCK_VALID_TREE,
};
use crate::candidates::is_worse;
use crate::state::ChainInner;

impl ChainInner {
    /// Best candidate whose ancestry back to the active chain is fully valid and has
    /// data. Candidates with a failed or missing ancestor are dropped along the way.
    pub(crate) fn find_most_work_chain(&mut self) -> Option<NodeId> {
        loop {
            let candidate = self.candidates.best()?;

            let mut test = candidate;
            let mut bad = None;
            while !self.chain.contains(&self.graph, test) {
                let node = self.graph.get(test);
                if node.failed() || !node.have_data() {
                    bad = Some(test);
                    break;
                }
                match node.prev {
                    Some(prev) => test = prev,
                    None => break,
                }
            }
            let Some(bad) = bad else {
                return Some(candidate);
            };

            let failed_chain = self.graph.get(bad).failed();
            if failed_chain {
                let more_work = match self.best_invalid {
                    Some(best) => self.graph.get(candidate).chain_work > self.graph.get(best).chain_work,
                    None => true,
                };
                if more_work {
                    self.best_invalid = Some(candidate);
                }
            }
            let mut walk = candidate;
            while walk != bad {
                let prev = self.graph.get(walk).prev;
                if failed_chain {
                    self.graph.get_mut(walk).status |= BLOCK_FAILED_CHILD;
                    self.graph.mark_dirty(walk);
                } else if let Some(prev) = prev {
                    self.unlinked.insert(prev, walk);
                }
                self.candidates.remove(walk);
                match prev {
                    Some(prev) => walk = prev,
                    None => break,
                }
            }
            self.candidates.remove(bad);
        }
    }

    /// Drops candidates that rank below the active tip.
    pub(crate) fn prune_candidates(&mut self) {
        if let Some(tip) = self.chain.tip() {
            self.candidates.prune_worse_than(&self.graph, tip);
        }
    }

    /// Walks the whole index depth-first and panics on any broken invariant.
    pub(crate) fn verify_block_index_tree(&self, genesis_hash: &Hash256) {
        let Some(tip) = self.chain.tip() else {
            check(self.graph.len() <= 1, "index has blocks but no active chain");
            return;
        };

        let mut children: HashMap<Option<NodeId>, Vec<NodeId>> = HashMap::new();
        for id in self.graph.ids() {
            children.entry(self.graph.get(id).prev).or_default().push(id);
        }
        let roots = children.remove(&None).unwrap_or_default();
        check(roots.len() == 1, "index must have exactly one root");

        let mut stack: Vec<Frame> = roots
            .into_iter()
            .map(|id| Frame {
                id,
                inherited: Ancestry::default(),
            })
            .collect();
        let mut visited = 0usize;
        while let Some(frame) = stack.pop() {
            visited += 1;
            let id = frame.id;
            let node = self.graph.get(id);
            let ancestry = frame.inherited.including(id, node);

            match node.prev {
                None => {
                    check(node.hash == *genesis_hash, "root is not the genesis block");
                    check(
                        self.chain.genesis() == Some(id),
                        "genesis is not the active chain root",
                    );
                }
                Some(prev) => {
                    let parent = self.graph.get(prev);
                    check(node.height == parent.height + 1, "height does not follow parent");
                    check(node.chain_work >= parent.chain_work, "chain work decreased");
                }
            }
            check(node.have_data() == (node.tx_count > 0), "data flag disagrees with tx count");
            check(
                (node.validity() >= BLOCK_VALID_TRANSACTIONS) == (node.tx_count > 0),
                "transaction validity disagrees with tx count",
            );
            if node.chain_tx == 0 {
                check(node.sequence_id == 0, "sequence id set without chain tx");
            }
            check(
                ancestry.first_missing.is_some() == (node.chain_tx == 0),
                "chain tx disagrees with missing ancestor data",
            );
            if node.height >= 2 {
                let skip_ok = node
                    .skip
                    .is_some_and(|skip| self.graph.get(skip).height < node.height);
                check(skip_ok, "skip pointer missing or not lower");
            }
            check(ancestry.first_not_tree.is_none(), "block is not tree valid");
            if node.validity() >= BLOCK_VALID_CHAIN {
                check(ancestry.first_not_chain.is_none(), "chain valid above a non-chain-valid parent");
            }
            if node.validity() >= BLOCK_VALID_SCRIPTS {
                check(
                    ancestry.first_not_scripts.is_none(),
                    "scripts valid above a non-scripts-valid parent",
                );
            }
            if ancestry.first_invalid.is_none() {
                check(!node.failed(), "failed flag without a failed ancestor");
            }

            let in_candidates = self.candidates.contains(id);
            if !is_worse(&self.graph, id, tip) && ancestry.first_missing.is_none() {
                if ancestry.first_invalid.is_none() {
                    check(in_candidates, "eligible block missing from candidates");
                }
            } else {
                check(!in_candidates, "ineligible block in candidates");
            }

            let in_unlinked = node
                .prev
                .is_some_and(|prev| self.unlinked.contains(prev, id));
            if node.prev.is_some()
                && node.have_data()
                && ancestry.first_missing.is_some()
                && ancestry.first_invalid.is_none()
            {
                check(in_unlinked, "block waiting on parent data is not linked");
            }
            if !node.have_data() || ancestry.first_missing.is_none() {
                check(!in_unlinked, "block wrongly waiting on parent data");
            }

            if let Some(kids) = children.get(&Some(id)) {
                stack.extend(kids.iter().map(|child| Frame {
                    id: *child,
                    inherited: ancestry,
                }));
            }
        }
        check(visited == self.graph.len(), "index contains unreachable blocks");
        stakd_log::log_debug_cat!(
            stakd_log::Category::Index,
            "block index consistent: {} entries, tip {}",
            visited,
            hash256_to_hex(&self.graph.get(tip).hash)
        );
    }
}

/// First ancestor (inclusive) failing each property, carried down the traversal.
/// `first_invalid` tracks only `BLOCK_FAILED_VALID`, so a `BLOCK_FAILED_CHILD`
/// flag must sit below one.
#[derive(Clone, Copy, Debug, Default)]
struct Ancestry {
    first_invalid: Option<NodeId>,
    first_missing: Option<NodeId>,
    first_not_tree: Option<NodeId>,
    first_not_chain: Option<NodeId>,
    first_not_scripts: Option<NodeId>,
}

impl Ancestry {
    fn including(self, id: NodeId, node: &crate::blockindex::BlockIndexNode) -> Self {
        let first = |current: Option<NodeId>, fails: bool| current.or(fails.then_some(id));
        let validity = node.validity();
        Self {
            first_invalid: first(self.first_invalid, node.status & BLOCK_FAILED_VALID != 0),
            first_missing: first(self.first_missing, !node.have_data()),
            first_not_tree: first(self.first_not_tree, validity < BLOCK_VALID_TREE),
            first_not_chain: first(self.first_not_chain, validity < BLOCK_VALID_CHAIN),
            first_not_scripts: first(self.first_not_scripts, validity < BLOCK_VALID_SCRIPTS),
        }
    }
}

struct Frame {
    id: NodeId,
    inherited: Ancestry,
}

fn check(condition: bool, what: &str) {
    if !condition {
        stakd_log::log_error!("block index check failed: {what}");
        panic!("BUG: block index check failed: {what}");
    }
}
