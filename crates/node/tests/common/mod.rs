#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use stakd::admission::TxPool;
use stakd::context::NodeContext;
use stakd::fees::min_relay_fee_for_size;
use stakd::notify::{NotificationHub, SyncType, ValidationListener};
use stakd::policy::{MempoolPolicy, DEFAULT_MIN_RELAY_TX_FEE};
use stakd_chainstate::flatfiles::DEFAULT_MAX_BLOCKFILE_SIZE;
use stakd_chainstate::{ChainSettings, ChainState, ChainTip, FixedClock, FlatFileStore};
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
use tempfile::TempDir;

pub const BLOCK_SPACING: u32 = 60;
/// Small enough that a freshly matured reward has too little priority to be free.
pub const REWARD: i64 = COIN;

pub fn regtest() -> ChainParams {
    chain_params(Network::Regtest)
}

pub fn standard_policy() -> MempoolPolicy {
    MempoolPolicy::standard(DEFAULT_MIN_RELAY_TX_FEE, true)
}

#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<(SyncType, Hash256)>>,
    tips: Mutex<Vec<i32>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<(SyncType, Hash256)> {
        self.events.lock().expect("events").clone()
    }

    pub fn kinds_for(&self, txid: &Hash256) -> Vec<SyncType> {
        self.events()
            .into_iter()
            .filter(|(_, id)| id == txid)
            .map(|(kind, _)| kind)
            .collect()
    }

    pub fn tips(&self) -> Vec<i32> {
        self.tips.lock().expect("tips").clone()
    }
}

impl ValidationListener for Recorder {
    fn sync_transaction(&self, tx: &Transaction, _block: Option<&Block>, kind: SyncType) {
        self.events.lock().expect("events").push((kind, tx.txid()));
    }

    fn updated_block_tip(&self, tip: &ChainTip) {
        self.tips.lock().expect("tips").push(tip.height);
    }
}

pub struct TestNode {
    pub context: NodeContext<MemoryStore>,
    pub recorder: Arc<Recorder>,
    pub params: ChainParams,
    _dir: TempDir,
}

impl TestNode {
    pub fn new(policy: MempoolPolicy) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let params = regtest();
        let blocks = FlatFileStore::open(dir.path(), params.message_start, DEFAULT_MAX_BLOCKFILE_SIZE)
            .expect("block files");
        let verifier = Arc::new(TemplateVerifier);
        let chain = ChainState::new(
            Arc::new(MemoryStore::new()),
            blocks,
            params.clone(),
            ChainSettings::for_params(&params),
            Arc::new(KernelProofGenerator::new(0)),
            verifier.clone(),
            Arc::new(FixedClock(i64::from(params.genesis.time) + 1_000_000)),
        );
        chain.init_genesis().expect("genesis");

        let hub = Arc::new(NotificationHub::new().expect("hub"));
        let recorder = Arc::new(Recorder::default());
        hub.register(recorder.clone());
        let pool = Arc::new(TxPool::new(policy, verifier, hub));
        Self {
            context: NodeContext::new(Arc::new(chain), pool),
            recorder,
            params,
            _dir: dir,
        }
    }

    pub fn genesis(&self) -> Parent {
        Parent {
            hash: self.context.chain().genesis_hash(),
            height: 0,
            time: self.params.genesis.time,
        }
    }

    /// Mines and connects a block on `parent`.
    pub fn mine_on(&self, parent: Parent, tag: u8, txs: Vec<Transaction>) -> Block {
        let block = mine(&self.params, parent, tag, txs);
        self.context.process_block(&block).expect("process block");
        block
    }

    /// Extends the active chain by `count` empty blocks; returns the new tip.
    pub fn mine_empty(&self, parent: Parent, count: usize, tag: u8) -> (Parent, Vec<Block>) {
        let mut parent = parent;
        let mut blocks = Vec::new();
        for _ in 0..count {
            let block = self.mine_on(parent, tag, Vec::new());
            parent = Parent::of(&block, parent.height + 1);
            blocks.push(block);
        }
        (parent, blocks)
    }

    pub fn tip_height(&self) -> i32 {
        self.context
            .chain()
            .tip()
            .expect("tip")
            .map_or(-1, |tip| tip.height)
    }

    pub fn pool_has(&self, tx: &Transaction) -> bool {
        self.context.pool().contains(&tx.txid())
    }

    pub fn flush_notifications(&self) {
        self.context.pool().hub().flush();
    }
}

pub fn key() -> (SecretKey, Vec<u8>) {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[1u8; 32]).expect("secret key");
    let public = PublicKey::from_secret_key(&secp, &secret);
    (secret, public.serialize().to_vec())
}

/// Every output in these tests pays here, spendable with `key()`.
pub fn wallet_script() -> Vec<u8> {
    p2pkh_script(&hash160(&key().1))
}

#[derive(Clone, Copy, Debug)]
pub struct Parent {
    pub hash: Hash256,
    pub height: i32,
    pub time: u32,
}

impl Parent {
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
        vout: vec![TxOut::new(REWARD, wallet_script())],
        lock_time: 0,
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
    block.header.merkle_root = block_merkle_root(&block).0;
    while check_proof_of_work(&block.hash(), block.header.bits, params).is_err() {
        block.header.nonce += 1;
    }
    block
}

pub fn reward_of(block: &Block) -> OutPoint {
    OutPoint::new(block.transactions[0].txid(), 0)
}

/// Signs every input of a transaction spending `wallet_script` outputs.
pub fn signed(prevouts: &[OutPoint], outputs: Vec<TxOut>) -> Transaction {
    let (secret, pubkey) = key();
    let secp = Secp256k1::new();
    let mut tx = Transaction {
        version: 1,
        vin: prevouts
            .iter()
            .map(|prevout| TxIn::new(prevout.clone(), Vec::new()))
            .collect(),
        vout: outputs,
        lock_time: 0,
    };
    let script_code = wallet_script();
    let mut script_sigs = Vec::with_capacity(tx.vin.len());
    for index in 0..tx.vin.len() {
        let digest = signature_hash(&tx, index, &script_code, SighashType(SIGHASH_ALL))
            .expect("sighash");
        let sig = secp.sign_ecdsa(&Message::from_digest(digest), &secret);
        let mut sig = sig.serialize_der().to_vec();
        sig.push(SIGHASH_ALL as u8);
        let mut script_sig = Vec::new();
        script_sig.push(sig.len() as u8);
        script_sig.extend_from_slice(&sig);
        script_sig.push(pubkey.len() as u8);
        script_sig.extend_from_slice(&pubkey);
        script_sigs.push(script_sig);
    }
    for (input, script_sig) in tx.vin.iter_mut().zip(script_sigs) {
        input.script_sig = script_sig;
    }
    tx
}

/// Spends `prevout` worth `value` to a single output, paying `fee`.
pub fn pay(prevout: OutPoint, value: i64, fee: i64) -> Transaction {
    signed(&[prevout], vec![TxOut::new(value - fee, wallet_script())])
}

/// Spends `prevout` paying exactly the relay fee for the signed size, minus `short`.
pub fn pay_relay_fee(prevout: OutPoint, value: i64, short: i64) -> Transaction {
    for size in 150..=260 {
        let fee = min_relay_fee_for_size(DEFAULT_MIN_RELAY_TX_FEE, size) - short;
        let tx = pay(prevout.clone(), value, fee);
        if tx.serialized_size() == size {
            return tx;
        }
    }
    panic!("no signature length matched the fee");
}
