//! Transaction types and serialization.

use stakd_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

pub const SEQUENCE_FINAL: u32 = u32::MAX;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn new(prevout: OutPoint, script_sig: Vec<u8>) -> Self {
        Self {
            prevout,
            script_sig,
            sequence: SEQUENCE_FINAL,
        }
    }

    pub fn is_final(&self) -> bool {
        self.sequence == SEQUENCE_FINAL
    }
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn new(value: i64, script_pubkey: Vec<u8>) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }

    /// Zero value with no script; only coinbase and coinstake may carry one.
    pub fn empty() -> Self {
        Self {
            value: 0,
            script_pubkey: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    /// A coinstake spends real inputs and marks itself with an empty first output.
    pub fn is_coinstake(&self) -> bool {
        !self.vin.is_empty()
            && !self.vin[0].prevout.is_null()
            && self.vout.len() >= 2
            && self.vout[0].is_empty()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.serialized_size());
        Encodable::consensus_encode(self, &mut encoder);
        encoder.into_inner()
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    pub fn serialized_size(&self) -> usize {
        use crate::encoding::varint_len;

        let inputs: usize = self
            .vin
            .iter()
            .map(|input| 36 + varint_len(input.script_sig.len() as u64) + input.script_sig.len() + 4)
            .sum();
        let outputs: usize = self
            .vout
            .iter()
            .map(|output| {
                8 + varint_len(output.script_pubkey.len() as u64) + output.script_pubkey.len()
            })
            .sum();
        4 + varint_len(self.vin.len() as u64)
            + inputs
            + varint_len(self.vout.len() as u64)
            + outputs
            + 4
    }

    /// Sum of output values, `None` on overflow.
    pub fn value_out(&self) -> Option<i64> {
        self.vout
            .iter()
            .try_fold(0i64, |total, output| total.checked_add(output.value))
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_vec(&self.vin);
        encoder.write_vec(&self.vout);
        encoder.write_u32_le(self.lock_time);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let vin = decoder.read_vec()?;
        let vout = decoder.read_vec()?;
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spend(hash_byte: u8) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::new([hash_byte; 32], 0), vec![0x51])],
            vout: vec![TxOut::new(5_000, vec![0x51])],
            lock_time: 0,
        }
    }

    #[test]
    fn serialized_size_matches_encoding() {
        let mut tx = spend(7);
        tx.vout.push(TxOut::new(1, vec![0u8; 300]));
        assert_eq!(tx.serialized_size(), tx.consensus_encode().len());
    }

    #[test]
    fn coinbase_and_coinstake_predicates() {
        let coinbase = Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::null(), vec![0x01, 0x01])],
            vout: vec![TxOut::new(50, vec![0x51])],
            lock_time: 0,
        };
        assert!(coinbase.is_coinbase());
        assert!(!coinbase.is_coinstake());

        let mut coinstake = spend(3);
        coinstake.vout.insert(0, TxOut::empty());
        assert!(coinstake.is_coinstake());
        assert!(!coinstake.is_coinbase());

        assert!(!spend(3).is_coinstake());
    }

    #[test]
    fn value_out_detects_overflow() {
        let mut tx = spend(1);
        tx.vout.push(TxOut::new(i64::MAX, Vec::new()));
        assert_eq!(tx.value_out(), None);
    }
}
