//! Block signatures.
//!
//! Proof-of-work blocks carry no signature. A proof-of-stake block is signed by the key
//! behind the coinstake's first paying output: a DER signature for pay-to-pubkey, a
//! compact recoverable signature for pay-to-pubkey-hash and vaults.

use secp256k1::ecdsa::{RecoverableSignature, RecoveryId, Signature};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use stakd_primitives::block::Block;
use stakd_primitives::hash::hash160;
use stakd_script::secp::secp256k1_verify;
use stakd_script::standard::{solver, TxOutType};

use crate::kernel::StakeError;

const COMPACT_SIGNATURE_LEN: usize = 65;

pub fn check_block_signature(block: &Block) -> Result<(), StakeError> {
    if block.is_proof_of_work() {
        if block.block_sig.is_empty() {
            return Ok(());
        }
        return Err(StakeError::BadSignature(
            "proof-of-work block carries a signature",
        ));
    }

    let output = block
        .transactions
        .get(1)
        .and_then(|coinstake| coinstake.vout.get(1))
        .ok_or(StakeError::BadSignature("coinstake has no paying output"))?;
    let (kind, solutions) = solver(&output.script_pubkey);
    if block.block_sig.is_empty() {
        return Err(StakeError::BadSignature("proof-of-stake block is unsigned"));
    }

    let message = Message::from_digest(block.hash());
    match kind {
        TxOutType::PubKey => {
            let pubkey = PublicKey::from_slice(&solutions[0])
                .map_err(|_| StakeError::BadSignature("invalid staking public key"))?;
            let mut sig = Signature::from_der(&block.block_sig)
                .map_err(|_| StakeError::BadSignature("invalid block signature encoding"))?;
            sig.normalize_s();
            secp256k1_verify()
                .verify_ecdsa(&message, &sig, &pubkey)
                .map_err(|_| StakeError::BadSignature("block signature verification failed"))
        }
        TxOutType::PubKeyHash => check_recovered_key(&message, &block.block_sig, &solutions[0]),
        TxOutType::Vault => check_recovered_key(&message, &block.block_sig, &solutions[1]),
        _ => Err(StakeError::BadSignature(
            "coinstake output type cannot sign blocks",
        )),
    }
}

fn check_recovered_key(
    message: &Message,
    compact: &[u8],
    expected_key_hash: &[u8],
) -> Result<(), StakeError> {
    if compact.len() != COMPACT_SIGNATURE_LEN {
        return Err(StakeError::BadSignature("compact signature has wrong length"));
    }
    let header = compact[0];
    if !(27..=34).contains(&header) {
        return Err(StakeError::BadSignature("compact signature header out of range"));
    }
    let compressed = header >= 31;
    let recovery = RecoveryId::from_i32(i32::from((header - 27) & 3))
        .map_err(|_| StakeError::BadSignature("invalid recovery id"))?;
    let sig = RecoverableSignature::from_compact(&compact[1..], recovery)
        .map_err(|_| StakeError::BadSignature("invalid compact signature"))?;
    let pubkey = secp256k1_verify()
        .recover_ecdsa(message, &sig)
        .map_err(|_| StakeError::BadSignature("public key recovery failed"))?;
    let key_hash = if compressed {
        hash160(&pubkey.serialize())
    } else {
        hash160(&pubkey.serialize_uncompressed())
    };
    if key_hash[..] != expected_key_hash[..] {
        return Err(StakeError::BadSignature("block signed by the wrong key"));
    }
    Ok(())
}

/// Compact recoverable signature over the block hash, compressed-key form.
pub fn sign_block_compact(block: &Block, secret: &SecretKey) -> Vec<u8> {
    let secp = Secp256k1::signing_only();
    let sig = secp.sign_ecdsa_recoverable(&Message::from_digest(block.hash()), secret);
    let (recovery, bytes) = sig.serialize_compact();
    let mut out = Vec::with_capacity(COMPACT_SIGNATURE_LEN);
    out.push(27 + 4 + recovery.to_i32() as u8);
    out.extend_from_slice(&bytes);
    out
}

/// DER signature over the block hash, for pay-to-pubkey coinstakes.
pub fn sign_block_der(block: &Block, secret: &SecretKey) -> Vec<u8> {
    let secp = Secp256k1::signing_only();
    secp.sign_ecdsa(&Message::from_digest(block.hash()), secret)
        .serialize_der()
        .to_vec()
}
