//! Unspent output set backed by the storage trait.

use stakd_consensus::Hash256;
use stakd_primitives::encoding::{DecodeError, Decoder, Encoder};
use stakd_primitives::outpoint::OutPoint;
use stakd_primitives::transaction::{Transaction, TxOut};
use stakd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

pub const OUTPOINT_KEY_LEN: usize = 36;

const META_COINS_TIP_KEY: &[u8] = b"coins_tip";

#[derive(Debug)]
pub enum CoinsError {
    Store(StoreError),
    Decode(DecodeError),
}

impl std::fmt::Display for CoinsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoinsError::Store(err) => write!(f, "{err}"),
            CoinsError::Decode(err) => write!(f, "corrupt coin entry: {err}"),
        }
    }
}

impl std::error::Error for CoinsError {}

impl From<StoreError> for CoinsError {
    fn from(err: StoreError) -> Self {
        CoinsError::Store(err)
    }
}

impl From<DecodeError> for CoinsError {
    fn from(err: DecodeError) -> Self {
        CoinsError::Decode(err)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Coin {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
    pub height: i32,
    pub is_coinbase: bool,
    pub is_coinstake: bool,
}

impl Coin {
    pub fn from_output(output: &TxOut, height: i32, tx: &Transaction) -> Self {
        Self {
            value: output.value,
            script_pubkey: output.script_pubkey.clone(),
            height,
            is_coinbase: tx.is_coinbase(),
            is_coinstake: tx.is_coinstake(),
        }
    }

    pub fn output(&self) -> TxOut {
        TxOut::new(self.value, self.script_pubkey.clone())
    }

    /// Coinbase and coinstake outputs both wait out the maturity period.
    pub fn is_reward(&self) -> bool {
        self.is_coinbase || self.is_coinstake
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_i32_le(self.height);
        let flags = u8::from(self.is_coinbase) | (u8::from(self.is_coinstake) << 1);
        encoder.write_u8(flags);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let height = decoder.read_i32_le()?;
        let flags = decoder.read_u8()?;
        if flags > 3 {
            return Err(DecodeError::InvalidData("unknown coin flags"));
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            value,
            script_pubkey,
            height,
            is_coinbase: flags & 1 != 0,
            is_coinstake: flags & 2 != 0,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct OutPointKey([u8; OUTPOINT_KEY_LEN]);

impl OutPointKey {
    pub fn new(outpoint: &OutPoint) -> Self {
        let mut bytes = [0u8; OUTPOINT_KEY_LEN];
        bytes[..32].copy_from_slice(&outpoint.hash);
        bytes[32..].copy_from_slice(&outpoint.index.to_le_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// Read access to unspent outputs.
pub trait CoinsView {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError>;

    fn have_coin(&self, outpoint: &OutPoint) -> Result<bool, CoinsError> {
        Ok(self.coin(outpoint)?.is_some())
    }

    /// True when any output of `txid` is still unspent. Views that cannot answer
    /// this cheaply report `false`.
    fn have_outputs(&self, _txid: &Hash256) -> Result<bool, CoinsError> {
        Ok(false)
    }
}

impl<T: CoinsView + ?Sized> CoinsView for &T {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        (**self).coin(outpoint)
    }

    fn have_outputs(&self, txid: &Hash256) -> Result<bool, CoinsError> {
        (**self).have_outputs(txid)
    }
}

pub struct UtxoSet<S> {
    store: S,
}

impl<S> UtxoSet<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: KeyValueStore> UtxoSet<S> {
    pub fn put(&self, batch: &mut WriteBatch, outpoint: &OutPoint, coin: &Coin) {
        let key = OutPointKey::new(outpoint);
        batch.put(Column::Utxo, key.as_bytes(), coin.encode());
    }

    pub fn delete(&self, batch: &mut WriteBatch, outpoint: &OutPoint) {
        let key = OutPointKey::new(outpoint);
        batch.delete(Column::Utxo, key.as_bytes());
    }

    /// Hash of the block the coin set currently reflects.
    pub fn best_block(&self) -> Result<Option<[u8; 32]>, CoinsError> {
        Ok(self
            .store
            .get(Column::Meta, META_COINS_TIP_KEY)?
            .and_then(|bytes| bytes.try_into().ok()))
    }

    pub fn set_best_block(&self, batch: &mut WriteBatch, hash: &[u8; 32]) {
        batch.put(Column::Meta, META_COINS_TIP_KEY, hash.to_vec());
    }
}

impl<S: KeyValueStore> CoinsView for UtxoSet<S> {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        let key = OutPointKey::new(outpoint);
        match self.store.get(Column::Utxo, key.as_bytes())? {
            Some(bytes) => Ok(Some(Coin::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn have_outputs(&self, txid: &Hash256) -> Result<bool, CoinsError> {
        Ok(!self.store.scan_prefix(Column::Utxo, txid)?.is_empty())
    }
}
