#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use stakd_chainstate::flatfiles::DEFAULT_MAX_BLOCKFILE_SIZE;
use stakd_chainstate::{ChainSettings, ChainState, FixedClock, FlatFileStore};
use stakd_consensus::constants::CURRENT_BLOCK_VERSION;
use stakd_consensus::money::COIN;
use stakd_consensus::{chain_params, ChainParams, Hash256, Network};
use stakd_pos::KernelProofGenerator;
use stakd_pow::check_proof_of_work;
use stakd_primitives::block::{Block, BlockHeader};
use stakd_primitives::hash::hash160;
use stakd_primitives::merkle::block_merkle_root;
use stakd_primitives::outpoint::OutPoint;
use stakd_primitives::transaction::{Transaction, TxIn, TxOut};
use stakd_script::sighash::{signature_hash, SighashType, SIGHASH_ALL};
use stakd_script::standard::p2pkh_script;
use stakd_script::{script_int_push, TemplateVerifier};
use stakd_storage::memory::MemoryStore;

pub const BLOCK_SPACING: u32 = 60;

pub fn regtest() -> ChainParams {
    chain_params(Network::Regtest)
}

pub fn now(params: &ChainParams) -> i64 {
    i64::from(params.genesis.time) + 1_000_000
}

pub fn settings() -> ChainSettings {
    ChainSettings::for_params(&regtest())
}

pub fn open_chain(
    store: Arc<MemoryStore>,
    dir: &Path,
    settings: ChainSettings,
) -> ChainState<MemoryStore> {
    open_chain_with_params(store, dir, regtest(), settings)
}

pub fn open_chain_with_params(
    store: Arc<MemoryStore>,
    dir: &Path,
    params: ChainParams,
    settings: ChainSettings,
) -> ChainState<MemoryStore> {
    let blocks = FlatFileStore::open(dir, params.message_start, DEFAULT_MAX_BLOCKFILE_SIZE)
        .expect("block files");
    let clock = FixedClock(now(&params));
    ChainState::new(
        store,
        blocks,
        params,
        settings,
        Arc::new(KernelProofGenerator::new(0)),
        Arc::new(TemplateVerifier),
        Arc::new(clock),
    )
}

/// Fresh chain state with genesis activated.
pub fn fresh_chain(dir: &Path) -> ChainState<MemoryStore> {
    fresh_chain_with(dir, settings())
}

pub fn fresh_chain_with(dir: &Path, settings: ChainSettings) -> ChainState<MemoryStore> {
    let chain = open_chain(Arc::new(MemoryStore::new()), dir, settings);
    chain.init_genesis().expect("genesis");
    chain
}

pub fn key(byte: u8) -> (SecretKey, Vec<u8>) {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[byte; 32]).expect("secret key");
    let public = PublicKey::from_secret_key(&secp, &secret);
    (secret, public.serialize().to_vec())
}

/// Output script every test coinbase pays to; spendable with `key(1)`.
pub fn miner_script() -> Vec<u8> {
    p2pkh_script(&hash160(&key(1).1))
}

/// Parent of the next block to mine.
#[derive(Clone, Copy, Debug)]
pub struct Parent {
    pub hash: Hash256,
    pub height: i32,
    pub time: u32,
}

impl Parent {
    pub fn genesis(chain: &ChainState<MemoryStore>) -> Self {
        Self {
            hash: chain.genesis_hash(),
            height: 0,
            time: chain.params().genesis.time,
        }
    }

    pub fn of(block: &Block, height: i32) -> Self {
        Self {
            hash: block.hash(),
            height,
            time: block.header.time,
        }
    }
}

pub fn coinbase(height: i32, tag: u8) -> Transaction {
    let mut script_sig = script_int_push(i64::from(height));
    script_sig.push(tag);
    Transaction {
        version: 1,
        vin: vec![TxIn::new(OutPoint::null(), script_sig)],
        vout: vec![TxOut::new(50 * COIN, miner_script())],
        lock_time: 0,
    }
}

/// Grinds the nonce until the header meets the regtest limit.
pub fn solve(block: &mut Block, params: &ChainParams) {
    block.header.merkle_root = block_merkle_root(block).0;
    while check_proof_of_work(&block.hash(), block.header.bits, params).is_err() {
        block.header.nonce += 1;
    }
}

pub fn mine(params: &ChainParams, parent: Parent, tag: u8, txs: Vec<Transaction>) -> Block {
    let height = parent.height + 1;
    let mut transactions = vec![coinbase(height, tag)];
    transactions.extend(txs);
    let mut block = Block {
        header: BlockHeader {
            version: CURRENT_BLOCK_VERSION,
            prev_block: parent.hash,
            merkle_root: [0u8; 32],
            time: parent.time + BLOCK_SPACING,
            bits: params.genesis.bits,
            nonce: 0,
        },
        transactions,
        block_sig: Vec::new(),
    };
    solve(&mut block, params);
    block
}

/// `count` empty blocks on top of `parent`, oldest first.
pub fn mine_chain(params: &ChainParams, parent: Parent, count: usize, tag: u8) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(count);
    let mut parent = parent;
    for _ in 0..count {
        let block = mine(params, parent, tag, Vec::new());
        parent = Parent::of(&block, parent.height + 1);
        blocks.push(block);
    }
    blocks
}

/// Spends `prevout` (paying to `miner_script`) into a single output.
pub fn spend(prevout: OutPoint, value: i64, script_pubkey: Vec<u8>) -> Transaction {
    let (secret, pubkey) = key(1);
    let mut tx = Transaction {
        version: 1,
        vin: vec![TxIn::new(prevout, Vec::new())],
        vout: vec![TxOut::new(value, script_pubkey)],
        lock_time: 0,
    };
    let digest = signature_hash(&tx, 0, &miner_script(), SighashType(SIGHASH_ALL))
        .expect("sighash");
    let sig = Secp256k1::new().sign_ecdsa(&Message::from_digest(digest), &secret);
    let mut sig = sig.serialize_der().to_vec();
    sig.push(SIGHASH_ALL as u8);
    let mut script_sig = Vec::new();
    script_sig.push(sig.len() as u8);
    script_sig.extend_from_slice(&sig);
    script_sig.push(pubkey.len() as u8);
    script_sig.extend_from_slice(&pubkey);
    tx.vin[0].script_sig = script_sig;
    tx
}
