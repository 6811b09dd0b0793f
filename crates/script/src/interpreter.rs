//! Script parsing, push-only evaluation, sigop counting and template verification.
//!
//! Full opcode evaluation is not supported: a scriptSig must be push-only and the
//! spent scriptPubKey must match one of the templates in [`crate::standard`].

use secp256k1::{ecdsa::Signature, Message, PublicKey};
use stakd_primitives::hash::hash160;
use stakd_primitives::transaction::Transaction;

use crate::opcodes::*;
use crate::secp::secp256k1_verify;
use crate::sighash::{signature_hash, SighashError, SighashType, SIGHASH_NONE, SIGHASH_SINGLE};
use crate::standard::{solver, TxOutType};

pub type ScriptFlags = u32;

pub const SCRIPT_VERIFY_NONE: ScriptFlags = 0;
pub const SCRIPT_VERIFY_P2SH: ScriptFlags = 1 << 0;
pub const SCRIPT_VERIFY_STRICTENC: ScriptFlags = 1 << 1;
pub const SCRIPT_VERIFY_LOW_S: ScriptFlags = 1 << 3;
pub const SCRIPT_VERIFY_NULLDUMMY: ScriptFlags = 1 << 4;
pub const SCRIPT_VERIFY_SIGPUSHONLY: ScriptFlags = 1 << 5;
pub const SCRIPT_VERIFY_MINIMALDATA: ScriptFlags = 1 << 6;
pub const SCRIPT_VERIFY_CLEANSTACK: ScriptFlags = 1 << 8;

/// Flags every block must satisfy.
pub const MANDATORY_SCRIPT_VERIFY_FLAGS: ScriptFlags = SCRIPT_VERIFY_P2SH;
/// Relay policy; a strict superset of the mandatory set.
pub const STANDARD_SCRIPT_VERIFY_FLAGS: ScriptFlags = MANDATORY_SCRIPT_VERIFY_FLAGS
    | SCRIPT_VERIFY_STRICTENC
    | SCRIPT_VERIFY_MINIMALDATA
    | SCRIPT_VERIFY_NULLDUMMY
    | SCRIPT_VERIFY_CLEANSTACK
    | SCRIPT_VERIFY_LOW_S;
pub const BLOCK_SCRIPT_VERIFY_FLAGS: ScriptFlags = SCRIPT_VERIFY_P2SH;

const MAX_PUBKEYS_PER_MULTISIG: u32 = 20;

#[derive(Debug)]
pub enum ScriptError {
    StackUnderflow,
    EvalFalse,
    BadOpcode,
    PushSize,
    SigEncoding,
    PubkeyEncoding,
    SigHashType,
    SigCheck,
    SigPushOnly,
    NullDummy,
    MinimalData,
    CleanStack,
    EqualVerify,
    RequireCoinstake,
    UnsupportedScript,
    InputIndexOutOfRange,
    Sighash(SighashError),
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::StackUnderflow => write!(f, "script stack underflow"),
            ScriptError::EvalFalse => write!(f, "script evaluated to false"),
            ScriptError::BadOpcode => write!(f, "truncated or invalid push"),
            ScriptError::PushSize => write!(f, "push exceeds maximum element size"),
            ScriptError::SigEncoding => write!(f, "invalid signature encoding"),
            ScriptError::PubkeyEncoding => write!(f, "invalid public key encoding"),
            ScriptError::SigHashType => write!(f, "invalid sighash type"),
            ScriptError::SigCheck => write!(f, "signature check failed"),
            ScriptError::SigPushOnly => write!(f, "scriptSig is not push-only"),
            ScriptError::NullDummy => write!(f, "null dummy element required"),
            ScriptError::MinimalData => write!(f, "non-minimal push"),
            ScriptError::CleanStack => write!(f, "extra items left on stack"),
            ScriptError::EqualVerify => write!(f, "public key hash mismatch"),
            ScriptError::RequireCoinstake => write!(f, "vault staking path requires a coinstake"),
            ScriptError::UnsupportedScript => write!(f, "scriptPubKey matches no known template"),
            ScriptError::InputIndexOutOfRange => write!(f, "input index out of range"),
            ScriptError::Sighash(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ScriptError {}

impl From<SighashError> for ScriptError {
    fn from(err: SighashError) -> Self {
        ScriptError::Sighash(err)
    }
}

const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Instruction<'a> {
    /// A data push, including `OP_0` (empty data).
    Push { opcode: u8, data: &'a [u8] },
    Op(u8),
}

/// Iterator over the instructions of a serialized script. Yields an error and stops
/// at the first truncated push.
pub struct Instructions<'a> {
    script: &'a [u8],
    cursor: usize,
    done: bool,
}

pub fn instructions(script: &[u8]) -> Instructions<'_> {
    Instructions {
        script,
        cursor: 0,
        done: false,
    }
}

impl<'a> Instructions<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], ScriptError> {
        let end = self.cursor.checked_add(len).ok_or(ScriptError::BadOpcode)?;
        if end > self.script.len() {
            return Err(ScriptError::BadOpcode);
        }
        let out = &self.script[self.cursor..end];
        self.cursor = end;
        Ok(out)
    }

    fn read_len(&mut self, width: usize) -> Result<usize, ScriptError> {
        let bytes = self.take(width)?;
        let mut value = 0usize;
        for (shift, byte) in bytes.iter().enumerate() {
            value |= (*byte as usize) << (8 * shift);
        }
        Ok(value)
    }

    fn next_instruction(&mut self) -> Result<Instruction<'a>, ScriptError> {
        let opcode = self.take(1)?[0];
        let len = match opcode {
            OP_0 => return Ok(Instruction::Push { opcode, data: &[] }),
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => self.read_len(1)?,
            OP_PUSHDATA2 => self.read_len(2)?,
            OP_PUSHDATA4 => self.read_len(4)?,
            _ => return Ok(Instruction::Op(opcode)),
        };
        let data = self.take(len)?;
        Ok(Instruction::Push { opcode, data })
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<Instruction<'a>, ScriptError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.cursor >= self.script.len() {
            return None;
        }
        let item = self.next_instruction();
        if item.is_err() {
            self.done = true;
        }
        Some(item)
    }
}

/// True when every instruction is a push or a small-integer opcode.
pub fn is_push_only(script: &[u8]) -> bool {
    for instruction in instructions(script) {
        match instruction {
            Ok(Instruction::Push { .. }) => {}
            Ok(Instruction::Op(opcode)) if opcode == OP_1NEGATE || (OP_1..=OP_16).contains(&opcode) => {}
            _ => return false,
        }
    }
    true
}

/// Runs a push-only script and returns the resulting stack.
pub fn eval_push_only(script: &[u8], flags: ScriptFlags) -> Result<Vec<Vec<u8>>, ScriptError> {
    let mut stack = Vec::new();
    for instruction in instructions(script) {
        match instruction? {
            Instruction::Push { opcode, data } => {
                if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
                    return Err(ScriptError::PushSize);
                }
                if (flags & SCRIPT_VERIFY_MINIMALDATA) != 0 && !check_minimal_push(data, opcode) {
                    return Err(ScriptError::MinimalData);
                }
                stack.push(data.to_vec());
            }
            Instruction::Op(OP_1NEGATE) => stack.push(vec![0x81]),
            Instruction::Op(opcode) if (OP_1..=OP_16).contains(&opcode) => {
                stack.push(vec![opcode - OP_1 + 1]);
            }
            Instruction::Op(_) => return Err(ScriptError::SigPushOnly),
        }
    }
    Ok(stack)
}

/// Signature operations in `script`. Inaccurate counting charges every multisig the
/// maximum key count; accurate counting reads the preceding small-integer opcode.
pub fn count_sigops(script: &[u8], accurate: bool) -> u32 {
    let mut count = 0u32;
    let mut last_opcode = None;
    for instruction in instructions(script) {
        let opcode = match instruction {
            Ok(Instruction::Push { opcode, .. }) => opcode,
            Ok(Instruction::Op(opcode)) => opcode,
            Err(_) => break,
        };
        match opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                count += match last_opcode {
                    Some(prev) if accurate && (OP_1..=OP_16).contains(&prev) => {
                        u32::from(prev - OP_1 + 1)
                    }
                    _ => MAX_PUBKEYS_PER_MULTISIG,
                };
            }
            _ => {}
        }
        last_opcode = Some(opcode);
    }
    count
}

/// Sigops of the redeem script pushed last by `script_sig`, when `script_pubkey` is P2SH.
pub fn p2sh_sigops(script_pubkey: &[u8], script_sig: &[u8]) -> u32 {
    if solver(script_pubkey).0 != TxOutType::ScriptHash {
        return 0;
    }
    let mut redeem: &[u8] = &[];
    for instruction in instructions(script_sig) {
        match instruction {
            Ok(Instruction::Push { data, .. }) => redeem = data,
            Ok(Instruction::Op(opcode)) if opcode == OP_1NEGATE || (OP_1..=OP_16).contains(&opcode) => {
                redeem = &[];
            }
            _ => return 0,
        }
    }
    count_sigops(redeem, true)
}

/// Encodes `value` the way a script pushes an integer: small-integer opcodes for
/// -1 and 0..=16, otherwise a minimal script-number push.
pub fn script_int_push(value: i64) -> Vec<u8> {
    if value == 0 {
        return vec![OP_0];
    }
    if value == -1 {
        return vec![OP_1NEGATE];
    }
    if (1..=16).contains(&value) {
        return vec![encode_small_int(value as u8)];
    }
    let data = script_num_to_vec(value);
    let mut out = Vec::with_capacity(data.len() + 1);
    out.push(data.len() as u8);
    out.extend_from_slice(&data);
    out
}

pub fn script_num_to_vec(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let mut abs = value.unsigned_abs();
    let mut result = Vec::new();
    while abs > 0 {
        result.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    let sign_bit = 0x80u8;
    if let Some(last) = result.last_mut() {
        if (*last & sign_bit) != 0 {
            result.push(if value < 0 { sign_bit } else { 0 });
        } else if value < 0 {
            *last |= sign_bit;
        }
    }
    result
}

pub(crate) fn cast_to_bool(data: &[u8]) -> bool {
    for (index, byte) in data.iter().enumerate() {
        if *byte != 0 {
            return !(index == data.len() - 1 && *byte == 0x80);
        }
    }
    false
}

fn check_minimal_push(data: &[u8], opcode: u8) -> bool {
    if data.is_empty() {
        return opcode == OP_0;
    }
    if data.len() == 1 && (1..=16).contains(&data[0]) {
        return opcode == OP_1 + (data[0] - 1);
    }
    if data.len() == 1 && data[0] == 0x81 {
        return opcode == OP_1NEGATE;
    }
    if data.len() <= 75 {
        return opcode == data.len() as u8;
    }
    if data.len() <= 255 {
        return opcode == OP_PUSHDATA1;
    }
    if data.len() <= 65535 {
        return opcode == OP_PUSHDATA2;
    }
    true
}

fn is_valid_pubkey(data: &[u8]) -> bool {
    match data.len() {
        33 => data[0] == 0x02 || data[0] == 0x03,
        65 => data[0] == 0x04,
        _ => false,
    }
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// Verifies that `script_sig` satisfies `script_pubkey` for input `input_index` of `tx`.
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    tx: &Transaction,
    input_index: usize,
    flags: ScriptFlags,
) -> Result<(), ScriptError> {
    if input_index >= tx.vin.len() {
        return Err(ScriptError::InputIndexOutOfRange);
    }
    if !is_push_only(script_sig) {
        return Err(ScriptError::SigPushOnly);
    }

    let checker = SignatureChecker {
        tx,
        input_index,
        flags,
    };
    let stack = eval_push_only(script_sig, flags)?;
    let consumed = eval_template(script_pubkey, &stack, &checker, true)?;
    if (flags & SCRIPT_VERIFY_CLEANSTACK) != 0 && consumed != stack.len() {
        return Err(ScriptError::CleanStack);
    }
    Ok(())
}

/// Checks the top of `stack` against a template script. Returns how many stack
/// items the template consumed.
fn eval_template(
    script_pubkey: &[u8],
    stack: &[Vec<u8>],
    checker: &SignatureChecker<'_>,
    allow_p2sh: bool,
) -> Result<usize, ScriptError> {
    let (kind, solutions) = solver(script_pubkey);
    let top = |depth: usize| -> Result<&Vec<u8>, ScriptError> {
        stack
            .len()
            .checked_sub(depth)
            .map(|index| &stack[index])
            .ok_or(ScriptError::StackUnderflow)
    };

    match kind {
        TxOutType::PubKey => {
            let sig = top(1)?;
            checker.require_sig(sig, &solutions[0], script_pubkey)?;
            Ok(1)
        }
        TxOutType::PubKeyHash => {
            let sig = top(2)?;
            let pubkey = top(1)?;
            if hash160(pubkey)[..] != solutions[0][..] {
                return Err(ScriptError::EqualVerify);
            }
            checker.require_sig(sig, pubkey, script_pubkey)?;
            Ok(2)
        }
        TxOutType::Vault => {
            let sig = top(3)?;
            let pubkey = top(2)?;
            let owner_path = cast_to_bool(top(1)?);
            let expected = if owner_path {
                &solutions[0]
            } else {
                if !checker.tx.is_coinstake() {
                    return Err(ScriptError::RequireCoinstake);
                }
                &solutions[1]
            };
            if hash160(pubkey)[..] != expected[..] {
                return Err(ScriptError::EqualVerify);
            }
            checker.require_sig(sig, pubkey, script_pubkey)?;
            Ok(3)
        }
        TxOutType::Multisig => {
            let required = solutions[0][0] as usize;
            let keys = &solutions[1..solutions.len() - 1];
            let dummy = top(required + 1)?;
            if (checker.flags & SCRIPT_VERIFY_NULLDUMMY) != 0 && !dummy.is_empty() {
                return Err(ScriptError::NullDummy);
            }
            let sigs = &stack[stack.len() - required..];
            let mut sig_index = 0usize;
            let mut key_index = 0usize;
            while sig_index < sigs.len() && key_index < keys.len() {
                if checker.check_sig(&sigs[sig_index], &keys[key_index], script_pubkey)? {
                    sig_index += 1;
                }
                key_index += 1;
                if keys.len() - key_index < sigs.len() - sig_index {
                    break;
                }
            }
            if sig_index != sigs.len() {
                return Err(ScriptError::SigCheck);
            }
            Ok(required + 1)
        }
        TxOutType::ScriptHash => {
            let redeem = top(1)?;
            if hash160(redeem)[..] != solutions[0][..] {
                return Err(ScriptError::EvalFalse);
            }
            if !allow_p2sh || (checker.flags & SCRIPT_VERIFY_P2SH) == 0 {
                return Ok(stack.len());
            }
            let inner = &stack[..stack.len() - 1];
            let consumed = eval_template(redeem, inner, checker, false)?;
            Ok(consumed + 1)
        }
        TxOutType::NullData => Err(ScriptError::EvalFalse),
        TxOutType::NonStandard => {
            stakd_log::log_debug!(
                "cannot evaluate non-template script {}",
                bytes_to_hex(script_pubkey)
            );
            Err(ScriptError::UnsupportedScript)
        }
    }
}

struct SignatureChecker<'a> {
    tx: &'a Transaction,
    input_index: usize,
    flags: ScriptFlags,
}

impl<'a> SignatureChecker<'a> {
    fn require_sig(
        &self,
        sig_bytes: &[u8],
        pubkey_bytes: &[u8],
        script_code: &[u8],
    ) -> Result<(), ScriptError> {
        if self.check_sig(sig_bytes, pubkey_bytes, script_code)? {
            Ok(())
        } else {
            Err(ScriptError::SigCheck)
        }
    }

    fn check_sig(
        &self,
        sig_bytes: &[u8],
        pubkey_bytes: &[u8],
        script_code: &[u8],
    ) -> Result<bool, ScriptError> {
        let Some((&hash_type, der)) = sig_bytes.split_last() else {
            return Ok(false);
        };
        let sighash_type = hash_type as u32;
        if (self.flags & SCRIPT_VERIFY_STRICTENC) != 0 {
            let base_type = sighash_type & 0x1f;
            if base_type != 0x01 && base_type != SIGHASH_NONE && base_type != SIGHASH_SINGLE {
                return Err(ScriptError::SigHashType);
            }
            if !is_valid_pubkey(pubkey_bytes) {
                return Err(ScriptError::PubkeyEncoding);
            }
        }

        let sig = match Signature::from_der(der) {
            Ok(sig) => sig,
            Err(_) if (self.flags & SCRIPT_VERIFY_STRICTENC) != 0 => {
                stakd_log::log_debug!(
                    "invalid DER signature (len {}): {}",
                    sig_bytes.len(),
                    bytes_to_hex(sig_bytes)
                );
                return Err(ScriptError::SigEncoding);
            }
            Err(_) => return Ok(false),
        };

        let mut normalized = sig;
        normalized.normalize_s();
        if (self.flags & SCRIPT_VERIFY_LOW_S) != 0 && normalized != sig {
            return Err(ScriptError::SigEncoding);
        }

        let pubkey = match PublicKey::from_slice(pubkey_bytes) {
            Ok(pubkey) => pubkey,
            Err(_) => return Ok(false),
        };
        let sighash = signature_hash(
            self.tx,
            self.input_index,
            script_code,
            SighashType(sighash_type),
        )?;

        let msg = Message::from_digest(sighash);
        Ok(secp256k1_verify()
            .verify_ecdsa(&msg, &normalized, &pubkey)
            .is_ok())
    }
}
