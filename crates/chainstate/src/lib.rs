//! Block index, best-chain selection and the coin set for stakd.

pub mod blockindex;
pub mod candidates;
pub mod chain;
pub mod coins;
pub mod contextual;
pub mod flatfiles;
pub mod genesis;
pub mod inputs;
pub mod proof;
mod selector;
pub mod state;
pub mod tip;
pub mod undo;
pub mod validation;

pub use coins::{Coin, CoinsError, CoinsView, UtxoSet};
pub use flatfiles::{FileLocation, FlatFileError, FlatFileStore};
pub use genesis::build_genesis_block;
pub use state::{
    ActivationStep, BlockInfo, ChainReadView, ChainSettings, ChainState, ChainStateError,
    ChainTip,
};
pub use tip::{ChainTipManager, UtxoTipManager};
pub use validation::{Clock, FixedClock, MissingKind, Rejection, SystemClock, ValidationError};
