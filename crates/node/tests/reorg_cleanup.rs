mod common;

use common::{mine, pay, reward_of, standard_policy, Parent, TestNode, REWARD};
use stakd::notify::SyncType;
use stakd::policy::DEFAULT_MIN_RELAY_TX_FEE;
use stakd_primitives::outpoint::OutPoint;

const FEE: i64 = 2 * DEFAULT_MIN_RELAY_TX_FEE;

#[test]
fn connected_block_evicts_mined_and_conflicting_transactions() {
    let node = TestNode::new(standard_policy());
    let (tip, blocks) = node.mine_empty(node.genesis(), 2, 1);

    let mined = pay(reward_of(&blocks[0]), REWARD, FEE);
    let pooled = pay(reward_of(&blocks[1]), REWARD, FEE);
    let rival = pay(reward_of(&blocks[1]), REWARD, FEE * 2);
    let rival_child = pay(OutPoint::new(rival.txid(), 0), REWARD - 2 * FEE, FEE);
    for tx in [&mined, &rival, &rival_child] {
        node.context.submit_transaction(tx).expect("pooled");
    }
    node.context
        .pool()
        .prioritise_transaction(mined.txid(), 0.0, 100)
        .expect("prioritise");

    node.mine_on(tip, 2, vec![mined.clone(), pooled.clone()]);
    assert_eq!(node.context.pool().size(), 0);
    let deltas = node
        .context
        .pool()
        .with_mempool(|pool| pool.deltas(&mined.txid()))
        .expect("pool");
    assert_eq!(deltas.fee_delta, 0);

    node.flush_notifications();
    assert_eq!(
        node.recorder.kinds_for(&mined.txid()),
        vec![SyncType::MempoolAdd, SyncType::NewBlock]
    );
    assert_eq!(
        node.recorder.kinds_for(&rival.txid()),
        vec![SyncType::MempoolAdd, SyncType::Conflicted]
    );
    assert_eq!(
        node.recorder.kinds_for(&rival_child.txid()),
        vec![SyncType::MempoolAdd, SyncType::Conflicted]
    );
    assert_eq!(node.recorder.kinds_for(&pooled.txid()), vec![SyncType::NewBlock]);
    assert_eq!(node.recorder.tips().last(), Some(&3));
}

#[test]
fn reorg_returns_transactions_and_drops_orphaned_spends() {
    let node = TestNode::new(standard_policy());
    let (b1, blocks) = node.mine_empty(node.genesis(), 1, 1);

    let returned = pay(reward_of(&blocks[0]), REWARD, FEE);
    let b2 = node.mine_on(b1, 1, vec![returned.clone()]);

    // spends the reward of the block about to be disconnected
    let stranded = pay(reward_of(&b2), REWARD, FEE);
    let follower = pay(OutPoint::new(returned.txid(), 0), REWARD - FEE, FEE);
    node.context.submit_transaction(&stranded).expect("stranded");
    node.context.submit_transaction(&follower).expect("follower");

    let fork_2 = mine(&node.params, b1, 9, Vec::new());
    let fork_3 = mine(&node.params, Parent::of(&fork_2, 2), 9, Vec::new());
    let steps = node.context.process_block(&fork_2).expect("fork 2");
    assert!(steps.is_empty());
    let steps = node.context.process_block(&fork_3).expect("fork 3");
    assert_eq!(steps.iter().map(|step| step.disconnected.len()).sum::<usize>(), 1);
    assert_eq!(node.tip_height(), 3);

    assert!(node.pool_has(&returned));
    assert!(node.pool_has(&follower));
    assert!(!node.pool_has(&stranded));
    node.context
        .pool()
        .with_mempool(|pool| {
            let entry = pool.get(&follower.txid()).expect("follower");
            assert_eq!(entry.parents, vec![returned.txid()]);
        })
        .expect("pool");

    node.flush_notifications();
    assert_eq!(
        node.recorder.kinds_for(&returned.txid()),
        vec![SyncType::NewBlock, SyncType::BlockDisconnect, SyncType::MempoolAdd]
    );
    assert_eq!(
        node.recorder.kinds_for(&b2.transactions[0].txid()),
        vec![SyncType::NewBlock, SyncType::BlockDisconnect]
    );
    assert_eq!(
        node.recorder.kinds_for(&fork_3.transactions[0].txid()),
        vec![SyncType::NewBlock]
    );
    let tip = node.context.chain().tip().expect("tip").expect("active chain");
    assert_eq!(tip.hash, fork_3.hash());
}

#[test]
fn invalidate_and_reconsider_move_transactions() {
    let node = TestNode::new(standard_policy());
    let (b1, blocks) = node.mine_empty(node.genesis(), 1, 1);
    let tx = pay(reward_of(&blocks[0]), REWARD, FEE);
    let b2 = node.mine_on(b1, 1, vec![tx.clone()]);
    assert!(!node.pool_has(&tx));

    node.context.invalidate_block(&b2.hash()).expect("invalidate");
    assert_eq!(node.tip_height(), 1);
    assert!(node.pool_has(&tx));

    node.context.reconsider_block(&b2.hash()).expect("reconsider");
    assert_eq!(node.tip_height(), 2);
    assert!(!node.pool_has(&tx));
}

#[test]
fn transaction_mined_on_both_branches_keeps_its_pooled_children() {
    let node = TestNode::new(standard_policy());
    let (b1, blocks) = node.mine_empty(node.genesis(), 1, 1);

    let shared = pay(reward_of(&blocks[0]), REWARD, FEE);
    let b2 = node.mine_on(b1, 1, vec![shared.clone()]);
    let child = pay(OutPoint::new(shared.txid(), 0), REWARD - FEE, FEE);
    node.context.submit_transaction(&child).expect("child");

    let fork_2 = mine(&node.params, b1, 9, vec![shared.clone()]);
    let fork_3 = mine(&node.params, Parent::of(&fork_2, 2), 9, Vec::new());
    node.context.process_block(&fork_2).expect("fork 2");
    let steps = node.context.process_block(&fork_3).expect("fork 3");
    let disconnected: Vec<_> = steps
        .iter()
        .flat_map(|step| step.disconnected.iter().map(|block| block.hash()))
        .collect();
    assert_eq!(disconnected, vec![b2.hash()]);
    assert_eq!(node.tip_height(), 3);

    assert!(!node.pool_has(&shared));
    assert!(node.pool_has(&child));
    node.context
        .pool()
        .with_mempool(|pool| {
            let entry = pool.get(&child.txid()).expect("child");
            assert!(entry.parents.is_empty());
        })
        .expect("pool");
}
