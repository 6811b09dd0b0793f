//! Genesis block construction from chain parameters.

use stakd_consensus::ChainParams;
use stakd_primitives::block::{Block, BlockHeader};
use stakd_primitives::merkle::block_merkle_root;
use stakd_primitives::outpoint::OutPoint;
use stakd_primitives::transaction::{Transaction, TxIn, TxOut};
use stakd_script::opcodes::OP_META;
use stakd_script::script_int_push;

/// Difficulty constant committed in every genesis coinbase.
const GENESIS_SCRIPT_BITS: i64 = 486_604_799;

pub fn build_genesis_block(params: &ChainParams) -> Block {
    let genesis = &params.genesis;
    let mut script_sig = script_int_push(GENESIS_SCRIPT_BITS);
    script_sig.extend_from_slice(&script_int_push(4));
    let message = genesis.timestamp_message.as_bytes();
    script_sig.push(message.len() as u8);
    script_sig.extend_from_slice(message);

    let coinbase = Transaction {
        version: 1,
        vin: vec![TxIn::new(OutPoint::null(), script_sig)],
        vout: vec![TxOut::new(genesis.reward, vec![OP_META])],
        lock_time: 0,
    };
    let mut block = Block {
        header: BlockHeader {
            version: genesis.version,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: genesis.time,
            bits: genesis.bits,
            nonce: genesis.nonce,
        },
        transactions: vec![coinbase],
        block_sig: Vec::new(),
    };
    block.header.merkle_root = block_merkle_root(&block).0;
    block
}
