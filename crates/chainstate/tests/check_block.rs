mod common;

use common::{coinbase, mine, now, regtest, spend, Parent};
use stakd_chainstate::validation::check_block;
use stakd_consensus::money::COIN;
use stakd_primitives::block::{Block, BlockHeader};
use stakd_primitives::merkle::block_merkle_root;
use stakd_primitives::outpoint::OutPoint;
use stakd_primitives::transaction::{Transaction, TxIn, TxOut};

fn regtest_parent() -> Parent {
    let params = regtest();
    Parent {
        hash: [3u8; 32],
        height: 7,
        time: params.genesis.time,
    }
}

#[test]
fn check_block_is_repeatable() {
    let params = regtest();
    let valid = mine(&params, regtest_parent(), 0, Vec::new());
    let mut broken = valid.clone();
    broken.transactions[0].vout[0].value = -1;

    for block in [&valid, &broken] {
        let first = check_block(block, &params, now(&params));
        let second = check_block(block, &params, now(&params));
        assert_eq!(first, second);
    }
    assert!(check_block(&valid, &params, now(&params)).is_ok());
}

#[test]
fn duplicated_transactions_are_rejected_as_mutation() {
    let params = regtest();
    let first = spend(OutPoint::new([4u8; 32], 0), COIN, vec![0x51]);
    let second = spend(OutPoint::new([5u8; 32], 1), COIN, vec![0x51]);
    let block = mine(&params, regtest_parent(), 0, vec![first, second.clone()]);
    check_block(&block, &params, now(&params)).expect("original");

    let mut mutated = block.clone();
    mutated.transactions.push(second);
    assert_eq!(block_merkle_root(&mutated).0, block.header.merkle_root);
    assert_eq!(mutated.hash(), block.hash());

    let err = check_block(&mutated, &params, now(&params)).expect_err("mutated");
    assert_eq!(err.reason(), Some("bad-txns-duplicate"));
    assert!(!err.marks_invalid());
}

#[test]
fn proof_of_stake_coinbase_must_be_empty() {
    let params = regtest();
    let coinstake = Transaction {
        version: 1,
        vin: vec![TxIn::new(OutPoint::new([6u8; 32], 0), Vec::new())],
        vout: vec![TxOut::empty(), TxOut::new(10 * COIN, vec![0x51])],
        lock_time: 0,
    };
    let mut block = Block {
        header: BlockHeader {
            version: 4,
            prev_block: [3u8; 32],
            merkle_root: [0u8; 32],
            time: params.genesis.time,
            bits: params.genesis.bits,
            nonce: 0,
        },
        transactions: vec![coinbase(101, 0), coinstake],
        block_sig: Vec::new(),
    };
    block.header.merkle_root = block_merkle_root(&block).0;
    assert!(block.is_proof_of_stake());

    let err = check_block(&block, &params, now(&params)).expect_err("paying coinbase");
    assert_eq!(
        err.reason(),
        Some("coinbase output not empty for proof-of-stake block")
    );
    assert_eq!(err.dos_score(), 100);

    block.transactions[0].vout = vec![TxOut::empty()];
    block.header.merkle_root = block_merkle_root(&block).0;
    check_block(&block, &params, now(&params)).expect("empty coinbase");
}

#[test]
fn far_future_block_is_rejected() {
    let params = regtest();
    let mut parent = regtest_parent();
    parent.time = u32::try_from(now(&params) + params.max_future_block_time_pow).expect("time");
    let block = mine(&params, parent, 0, Vec::new());
    let err = check_block(&block, &params, now(&params)).expect_err("future");
    assert_eq!(err.reason(), Some("time-too-new"));
}
