mod common;

use common::{pay, reward_of, standard_policy, TestNode, REWARD};
use stakd::mempool::MempoolErrorKind;
use stakd::policy::DEFAULT_MIN_RELAY_TX_FEE;
use stakd_primitives::outpoint::OutPoint;

const FEE: i64 = 2 * DEFAULT_MIN_RELAY_TX_FEE;

#[test]
fn orphan_is_admitted_when_parent_arrives() {
    let node = TestNode::new(standard_policy());
    let (_, blocks) = node.mine_empty(node.genesis(), 1, 1);
    let parent = pay(reward_of(&blocks[0]), REWARD, FEE);
    let child = pay(OutPoint::new(parent.txid(), 0), REWARD - FEE, FEE);
    let grandchild = pay(OutPoint::new(child.txid(), 0), REWARD - 2 * FEE, FEE);

    let err = node
        .context
        .submit_transaction(&grandchild)
        .expect_err("grandchild first");
    assert_eq!(err.kind, MempoolErrorKind::MissingInput);
    assert_eq!(err.missing_inputs, vec![OutPoint::new(child.txid(), 0)]);
    node.context
        .submit_transaction(&child)
        .expect_err("child before parent");

    let orphans = node
        .context
        .pool()
        .with_mempool(|pool| pool.orphan_count())
        .expect("pool");
    assert_eq!(orphans, 2);

    let accepted = node.context.submit_transaction(&parent).expect("parent");
    assert_eq!(accepted, vec![parent.txid(), child.txid(), grandchild.txid()]);
    assert_eq!(node.context.pool().size(), 3);
    node.context
        .pool()
        .with_mempool(|pool| {
            assert_eq!(pool.orphan_count(), 0);
            let entry = pool.get(&grandchild.txid()).expect("grandchild");
            assert_eq!(entry.parents, vec![child.txid()]);
        })
        .expect("pool");
}

#[test]
fn invalid_orphan_is_dropped_on_retry() {
    let node = TestNode::new(standard_policy());
    let (_, blocks) = node.mine_empty(node.genesis(), 1, 1);
    let parent = pay(reward_of(&blocks[0]), REWARD, FEE);
    // spends more than the parent output holds
    let greedy = pay(OutPoint::new(parent.txid(), 0), REWARD, 0);

    node.context.submit_transaction(&greedy).expect_err("orphan");
    let accepted = node.context.submit_transaction(&parent).expect("parent");
    assert_eq!(accepted, vec![parent.txid()]);
    assert!(!node.pool_has(&greedy));
    let orphans = node
        .context
        .pool()
        .with_mempool(|pool| pool.orphan_count())
        .expect("pool");
    assert_eq!(orphans, 0);
}
