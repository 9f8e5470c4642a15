//! Transaction preparation: nonce allocation, gas estimation and signing

mod gas;
mod nonce;
mod signer;

pub use gas::{add_gas_buffer, bump_gas_price, GasEstimate, GasEstimator};
pub use nonce::{NonceLock, NonceTracker};
pub use signer::{
    CounterSignResources, LocalWalletSigner, SignOptions, SignedTransaction, TransactionSigner,
};

#[cfg(test)]
pub use signer::MockTransactionSigner;
