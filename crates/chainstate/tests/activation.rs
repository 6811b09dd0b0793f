mod common;

use common::{fresh_chain, fresh_chain_with, mine, mine_chain, regtest, settings, solve, Parent};
use stakd_chainstate::blockindex::{BLOCK_FAILED_MASK, BLOCK_FAILED_VALID};
use stakd_chainstate::{MissingKind, ValidationError};
use stakd_primitives::outpoint::OutPoint;

#[test]
fn out_of_order_blocks_activate_once_linked() {
    let dir = tempfile::tempdir().expect("tempdir");
    let chain = fresh_chain(dir.path());
    let params = regtest();
    let blocks = mine_chain(&params, Parent::genesis(&chain), 5, 0);

    for block in &blocks {
        chain.process_block_header(&block.header).expect("header");
    }
    for index in [2, 0, 1, 4, 3] {
        chain.process_new_block(&blocks[index]).expect("block");
        chain.verify_block_index().expect("consistent index");
    }

    let tip = chain.tip().expect("tip").expect("active tip");
    assert_eq!(tip.hash, blocks[4].hash());
    assert_eq!(tip.height, 5);
    assert_eq!(tip.chain_tx, 6);
    assert_eq!(chain.candidate_count().expect("candidates"), 1);
    for (height, block) in blocks.iter().enumerate() {
        assert_eq!(
            chain.hash_at(height as i32 + 1).expect("hash"),
            Some(block.hash())
        );
    }
}

#[test]
fn block_with_unknown_parent_waits_for_data() {
    let dir = tempfile::tempdir().expect("tempdir");
    let chain = fresh_chain(dir.path());
    let params = regtest();
    let blocks = mine_chain(&params, Parent::genesis(&chain), 2, 0);

    let err = chain.process_new_block(&blocks[1]).expect_err("unknown parent");
    assert!(matches!(
        err.validation(),
        Some(ValidationError::MissingData(MissingKind::PrevBlock))
    ));
    assert!(chain.block_info(&blocks[1].hash()).expect("info").is_none());

    chain.process_new_block(&blocks[0]).expect("parent");
    chain.process_new_block(&blocks[1]).expect("retry");
    assert_eq!(chain.tip().expect("tip").expect("tip").hash, blocks[1].hash());
}

#[test]
fn heavier_fork_overtakes_without_invalidating() {
    let dir = tempfile::tempdir().expect("tempdir");
    let chain = fresh_chain(dir.path());
    let params = regtest();
    let base = mine_chain(&params, Parent::genesis(&chain), 3, 0);
    let fork_point = Parent::of(&base[2], 3);
    let chain_a = mine_chain(&params, fork_point, 3, 1);
    let chain_b = mine_chain(&params, fork_point, 5, 2);

    for block in base.iter().chain(&chain_a) {
        chain.process_new_block(block).expect("chain a");
    }
    assert_eq!(chain.tip().expect("tip").expect("tip").hash, chain_a[2].hash());

    let mut reorg_steps = Vec::new();
    for block in &chain_b {
        let steps = chain.process_new_block(block).expect("chain b");
        reorg_steps.extend(steps.into_iter().filter(|step| !step.disconnected.is_empty()));
    }

    let tip = chain.tip().expect("tip").expect("tip");
    assert_eq!(tip.hash, chain_b[4].hash());
    assert_eq!(tip.height, 8);

    assert_eq!(reorg_steps.len(), 1);
    let reorg = &reorg_steps[0];
    assert_eq!(reorg.disconnected.len(), 3);
    assert_eq!(reorg.disconnected[0].hash(), chain_a[2].hash());
    assert_eq!(reorg.connected.len(), 4);
    assert_eq!(reorg.connected[0].1, 4);

    for block in &chain_a {
        let info = chain
            .block_info(&block.hash())
            .expect("info")
            .expect("indexed");
        assert_eq!(info.status & BLOCK_FAILED_MASK, 0);
        assert!(!info.on_active_chain);
    }
    assert!(chain.best_invalid().expect("best invalid").is_none());

    let abandoned = OutPoint::new(chain_a[0].transactions[0].txid(), 0);
    let adopted = OutPoint::new(chain_b[0].transactions[0].txid(), 0);
    let (abandoned, adopted) = chain
        .with_view(|view| {
            (
                view.coins.coin(&abandoned).expect("coin"),
                view.coins.coin(&adopted).expect("coin"),
            )
        })
        .expect("view");
    assert!(abandoned.is_none());
    assert_eq!(adopted.expect("fork coinbase").height, 4);
}

#[test]
fn equal_work_keeps_first_received() {
    let dir = tempfile::tempdir().expect("tempdir");
    let chain = fresh_chain(dir.path());
    let params = regtest();
    let first = mine(&params, Parent::genesis(&chain), 1, Vec::new());
    let second = mine(&params, Parent::genesis(&chain), 2, Vec::new());

    chain.process_new_block(&first).expect("first");
    chain.process_new_block(&second).expect("second");
    assert_eq!(chain.tip().expect("tip").expect("tip").hash, first.hash());
    let info = chain
        .block_info(&second.hash())
        .expect("info")
        .expect("indexed");
    assert!(!info.is_candidate);
}

#[test]
fn fork_below_reorg_depth_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut settings = settings();
    settings.max_reorg_depth = 3;
    let chain = fresh_chain_with(dir.path(), settings);
    let params = regtest();
    let blocks = mine_chain(&params, Parent::genesis(&chain), 6, 0);
    for block in &blocks {
        chain.process_new_block(block).expect("block");
    }

    let too_deep = mine(&params, Parent::of(&blocks[1], 2), 7, Vec::new());
    let err = chain.process_new_block(&too_deep).expect_err("deep fork");
    let rejection = err.validation().and_then(ValidationError::rejection).expect("rejection");
    assert_eq!(rejection.reason, "bad-fork-depth");
    assert_eq!(rejection.dos, 1);
    assert!(chain.block_info(&too_deep.hash()).expect("info").is_none());

    let shallow = mine(&params, Parent::of(&blocks[2], 3), 7, Vec::new());
    chain.process_new_block(&shallow).expect("shallow fork");
    assert_eq!(chain.tip().expect("tip").expect("tip").hash, blocks[5].hash());
}

#[test]
fn accepting_stored_block_again_is_a_no_op() {
    let dir = tempfile::tempdir().expect("tempdir");
    let chain = fresh_chain(dir.path());
    let params = regtest();
    let block = mine(&params, Parent::genesis(&chain), 0, Vec::new());

    chain.process_new_block(&block).expect("first");
    let before = chain.block_info(&block.hash()).expect("info");
    let steps = chain.process_new_block(&block).expect("again");
    assert!(steps.is_empty());
    assert_eq!(chain.block_info(&block.hash()).expect("info"), before);
}

#[test]
fn invalid_block_is_marked_and_descendants_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let chain = fresh_chain(dir.path());
    let params = regtest();
    let mut bad = mine(&params, Parent::genesis(&chain), 0, Vec::new());
    bad.transactions[0] = common::coinbase(5, 0);
    solve(&mut bad, &params);

    let err = chain.process_new_block(&bad).expect_err("wrong coinbase height");
    let rejection = err.validation().and_then(ValidationError::rejection).expect("rejection");
    assert_eq!(rejection.reason, "bad-cb-height");
    assert_eq!(rejection.dos, 100);
    let info = chain.block_info(&bad.hash()).expect("info").expect("indexed");
    assert_ne!(info.status & BLOCK_FAILED_VALID, 0);

    let child = mine(&params, Parent::of(&bad, 1), 0, Vec::new());
    let err = chain.process_new_block(&child).expect_err("invalid parent");
    assert_eq!(err.validation().and_then(ValidationError::reason), Some("bad-prevblk"));
    assert_eq!(err.validation().map(ValidationError::dos_score), Some(100));
    assert_eq!(
        chain.tip().expect("tip").expect("tip").hash,
        chain.genesis_hash()
    );
    chain.verify_block_index().expect("consistent index");
}
