use stakd_consensus::Hash256;
use stakd_primitives::block::{Block, BlockHeader, HEADER_SIZE};
use stakd_primitives::encoding::{decode, encode, DecodeError};
use stakd_primitives::outpoint::OutPoint;
use stakd_primitives::transaction::{Transaction, TxIn, TxOut};

fn seq_hash(start: u8) -> Hash256 {
    std::array::from_fn(|i| start.wrapping_add(i as u8))
}

fn push_hash_le(buffer: &mut Vec<u8>, start: u8) {
    for byte in 0u8..=0x1f {
        buffer.push(start.wrapping_add(byte));
    }
}

fn sample_header() -> BlockHeader {
    BlockHeader {
        version: 4,
        prev_block: seq_hash(0x00),
        merkle_root: seq_hash(0x20),
        time: 0x01020304,
        bits: 0x0a0b0c0d,
        nonce: 0x11223344,
    }
}

fn coinbase() -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn::new(OutPoint::null(), vec![0x51, 0x00])],
        vout: vec![TxOut::new(50, vec![0x51])],
        lock_time: 0,
    }
}

#[test]
fn serialize_block_header_layout() {
    let encoded = sample_header().consensus_encode();
    let mut expected = Vec::new();
    expected.extend_from_slice(&4i32.to_le_bytes());
    push_hash_le(&mut expected, 0x00);
    push_hash_le(&mut expected, 0x20);
    expected.extend_from_slice(&0x01020304u32.to_le_bytes());
    expected.extend_from_slice(&0x0a0b0c0du32.to_le_bytes());
    expected.extend_from_slice(&0x11223344u32.to_le_bytes());
    assert_eq!(encoded.len(), HEADER_SIZE);
    assert_eq!(encoded, expected);
}

#[test]
fn serialize_transaction_layout() {
    let tx = Transaction {
        version: 2,
        vin: vec![TxIn {
            prevout: OutPoint::new(seq_hash(0x40), 3),
            script_sig: vec![0xaa, 0xbb],
            sequence: 0xfffffffe,
        }],
        vout: vec![TxOut::new(0x0102030405060708, vec![0xcc])],
        lock_time: 99,
    };

    let mut expected = Vec::new();
    expected.extend_from_slice(&2i32.to_le_bytes());
    expected.push(1);
    push_hash_le(&mut expected, 0x40);
    expected.extend_from_slice(&3u32.to_le_bytes());
    expected.extend_from_slice(&[2, 0xaa, 0xbb]);
    expected.extend_from_slice(&0xfffffffeu32.to_le_bytes());
    expected.push(1);
    expected.extend_from_slice(&0x0102030405060708i64.to_le_bytes());
    expected.extend_from_slice(&[1, 0xcc]);
    expected.extend_from_slice(&99u32.to_le_bytes());

    assert_eq!(tx.consensus_encode(), expected);
    assert_eq!(encode(&tx), expected);
    let decoded: Transaction = decode(&expected).expect("decode tx");
    assert_eq!(decoded, tx);
}

#[test]
fn proof_of_work_block_has_no_signature_field() {
    let block = Block {
        header: sample_header(),
        transactions: vec![coinbase()],
        block_sig: Vec::new(),
    };
    let bytes = block.consensus_encode();
    assert_eq!(bytes.len(), block.serialized_size());
    let decoded = Block::consensus_decode(&bytes).expect("decode block");
    assert_eq!(decoded, block);
    assert!(decoded.is_proof_of_work());
}

#[test]
fn proof_of_stake_block_carries_signature() {
    let coinstake = Transaction {
        version: 1,
        vin: vec![TxIn::new(OutPoint::new(seq_hash(0x60), 0), vec![0x51])],
        vout: vec![TxOut::empty(), TxOut::new(1_000, vec![0x51])],
        lock_time: 0,
    };
    let mut base = coinbase();
    base.vout = vec![TxOut::empty()];
    let block = Block {
        header: sample_header(),
        transactions: vec![base, coinstake],
        block_sig: vec![0x30, 0x01, 0x02],
    };
    assert!(block.is_proof_of_stake());

    let bytes = block.consensus_encode();
    assert_eq!(bytes.len(), block.serialized_size());
    assert_eq!(&bytes[bytes.len() - 4..], &[3, 0x30, 0x01, 0x02]);
    let decoded = Block::consensus_decode(&bytes).expect("decode block");
    assert_eq!(decoded, block);
}

#[test]
fn block_decode_rejects_trailing_bytes() {
    let block = Block {
        header: sample_header(),
        transactions: vec![coinbase()],
        block_sig: Vec::new(),
    };
    let mut bytes = block.consensus_encode();
    bytes.push(0);
    assert_eq!(
        Block::consensus_decode(&bytes),
        Err(DecodeError::TrailingBytes)
    );
}

#[test]
fn truncated_block_is_eof() {
    let block = Block {
        header: sample_header(),
        transactions: vec![coinbase()],
        block_sig: Vec::new(),
    };
    let bytes = block.consensus_encode();
    assert_eq!(
        Block::consensus_decode(&bytes[..bytes.len() - 1]),
        Err(DecodeError::UnexpectedEof)
    );
}
