//! Transaction preparation: credentials, nonce allocation and gas pricing

mod gas;
mod nonce;
pub mod signer;

pub use gas::{GasEstimator, TxFields};
pub use nonce::NonceTracker;
pub use signer::{BoundSigner, Credential};
