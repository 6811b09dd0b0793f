//! Standard script templates and their classification.

use crate::interpreter::{instructions, Instruction};
use crate::opcodes::*;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TxOutType {
    NonStandard,
    PubKey,
    PubKeyHash,
    ScriptHash,
    Multisig,
    NullData,
    Vault,
}

impl TxOutType {
    pub fn as_str(self) -> &'static str {
        match self {
            TxOutType::NonStandard => "nonstandard",
            TxOutType::PubKey => "pubkey",
            TxOutType::PubKeyHash => "pubkeyhash",
            TxOutType::ScriptHash => "scripthash",
            TxOutType::Multisig => "multisig",
            TxOutType::NullData => "nulldata",
            TxOutType::Vault => "vault",
        }
    }
}

const VAULT_SCRIPT_LEN: usize = 50;

/// Matches `script` against the known templates and extracts the template data:
/// the key for `PubKey`, the hash for `PubKeyHash`/`ScriptHash`, `[m], keys.., [n]` for
/// `Multisig`, and `owner hash, staking hash` for `Vault`.
pub fn solver(script: &[u8]) -> (TxOutType, Vec<Vec<u8>>) {
    if is_p2sh(script) {
        return (TxOutType::ScriptHash, vec![script[2..22].to_vec()]);
    }
    if script.first() == Some(&OP_META) {
        return (TxOutType::NullData, Vec::new());
    }
    if is_p2pkh(script) {
        return (TxOutType::PubKeyHash, vec![script[3..23].to_vec()]);
    }
    if is_vault(script) {
        return (
            TxOutType::Vault,
            vec![script[2..22].to_vec(), script[25..45].to_vec()],
        );
    }
    if let Some(pubkey) = match_p2pk(script) {
        return (TxOutType::PubKey, vec![pubkey.to_vec()]);
    }
    if let Some(solutions) = match_multisig(script) {
        return (TxOutType::Multisig, solutions);
    }
    (TxOutType::NonStandard, Vec::new())
}

pub fn classify_script_pubkey(script: &[u8]) -> TxOutType {
    solver(script).0
}

/// Relay standardness of an output script. `max_datacarrier` bounds `OP_META` outputs,
/// `None` disables them.
pub fn is_standard_script_pubkey(
    script: &[u8],
    max_datacarrier: Option<usize>,
) -> Option<TxOutType> {
    let (kind, solutions) = solver(script);
    match kind {
        TxOutType::NonStandard => None,
        TxOutType::Multisig => {
            let m = solutions[0][0];
            let n = solutions[solutions.len() - 1][0];
            if !(1..=3).contains(&n) || m < 1 || m > n {
                return None;
            }
            Some(kind)
        }
        TxOutType::NullData => match max_datacarrier {
            Some(limit) if script.len() <= limit => Some(kind),
            _ => None,
        },
        _ => Some(kind),
    }
}

/// Number of scriptSig stack items a standard spend of this template leaves.
pub fn args_expected(kind: TxOutType, solutions: &[Vec<u8>]) -> Option<usize> {
    match kind {
        TxOutType::NonStandard | TxOutType::NullData => None,
        TxOutType::PubKey => Some(1),
        TxOutType::PubKeyHash => Some(2),
        TxOutType::ScriptHash => Some(1),
        TxOutType::Vault => Some(3),
        TxOutType::Multisig => {
            let m = solutions.first()?.first()?;
            Some(*m as usize + 1)
        }
    }
}

pub fn p2pkh_script(key_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[OP_DUP, OP_HASH160, 0x14]);
    script.extend_from_slice(key_hash);
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

pub fn p2pk_script(pubkey: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(pubkey.len() + 2);
    script.push(pubkey.len() as u8);
    script.extend_from_slice(pubkey);
    script.push(OP_CHECKSIG);
    script
}

pub fn p2sh_script(script_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.extend_from_slice(&[OP_HASH160, 0x14]);
    script.extend_from_slice(script_hash);
    script.push(OP_EQUAL);
    script
}

/// Funds spendable by `owner` at any time or by `staker` inside a coinstake.
pub fn vault_script(owner: &[u8; 20], staker: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(VAULT_SCRIPT_LEN);
    script.extend_from_slice(&[OP_IF, 0x14]);
    script.extend_from_slice(owner);
    script.extend_from_slice(&[OP_ELSE, OP_REQUIRE_COINSTAKE, 0x14]);
    script.extend_from_slice(staker);
    script.extend_from_slice(&[OP_ENDIF, OP_OVER, OP_HASH160, OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

pub fn multisig_script(required: u8, pubkeys: &[Vec<u8>]) -> Vec<u8> {
    let mut script = vec![encode_small_int(required)];
    for key in pubkeys {
        script.push(key.len() as u8);
        script.extend_from_slice(key);
    }
    script.push(encode_small_int(pubkeys.len() as u8));
    script.push(OP_CHECKMULTISIG);
    script
}

pub fn null_data_script(payload: &[u8]) -> Vec<u8> {
    let mut script = vec![OP_META];
    if payload.len() <= 75 {
        script.push(payload.len() as u8);
    } else {
        script.push(OP_PUSHDATA1);
        script.push(payload.len() as u8);
    }
    script.extend_from_slice(payload);
    script
}

fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

pub(crate) fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

fn is_vault(script: &[u8]) -> bool {
    script.len() == VAULT_SCRIPT_LEN
        && script[0] == OP_IF
        && script[1] == 0x14
        && script[22] == OP_ELSE
        && script[23] == OP_REQUIRE_COINSTAKE
        && script[24] == 0x14
        && script[45..] == [OP_ENDIF, OP_OVER, OP_HASH160, OP_EQUALVERIFY, OP_CHECKSIG]
}

fn match_p2pk(script: &[u8]) -> Option<&[u8]> {
    let key_len = match script.first().copied() {
        Some(len @ 33) => len,
        Some(len @ 65) => len,
        _ => return None,
    };

    let expected_len = key_len as usize + 2;
    if script.len() == expected_len && script[script.len() - 1] == OP_CHECKSIG {
        Some(&script[1..script.len() - 1])
    } else {
        None
    }
}

fn match_multisig(script: &[u8]) -> Option<Vec<Vec<u8>>> {
    let parsed: Vec<Instruction<'_>> = instructions(script).collect::<Result<_, _>>().ok()?;
    if parsed.len() < 4 {
        return None;
    }
    let small_int = |instruction: &Instruction<'_>| match instruction {
        Instruction::Op(opcode) => decode_small_int(*opcode),
        Instruction::Push { .. } => None,
    };
    let required = small_int(&parsed[0])?;
    let total = small_int(&parsed[parsed.len() - 2])?;
    if parsed[parsed.len() - 1] != Instruction::Op(OP_CHECKMULTISIG) {
        return None;
    }

    let mut solutions = vec![vec![required]];
    for instruction in &parsed[1..parsed.len() - 2] {
        match instruction {
            Instruction::Push { data, .. } if (33..=65).contains(&data.len()) => {
                solutions.push(data.to_vec());
            }
            _ => return None,
        }
    }
    let key_count = solutions.len() - 1;
    if key_count != total as usize || required == 0 || required as usize > key_count {
        return None;
    }
    solutions.push(vec![total]);
    Some(solutions)
}
