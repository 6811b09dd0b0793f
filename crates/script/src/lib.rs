//! Script templates, push-only evaluation, sigop counting and template signature checks.

pub mod interpreter;
pub mod opcodes;
pub mod secp;
pub mod sighash;
pub mod standard;
pub mod verify;

pub use interpreter::{
    count_sigops, eval_push_only, is_push_only, p2sh_sigops, script_int_push, verify_script,
    ScriptError, ScriptFlags, MANDATORY_SCRIPT_VERIFY_FLAGS, STANDARD_SCRIPT_VERIFY_FLAGS,
};
pub use standard::{classify_script_pubkey, solver, TxOutType};
pub use verify::{ScriptVerifier, TemplateVerifier};
