//! Error types for the wallet transaction engine

use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum TxError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid transaction params: {0}")]
    Validation(String),

    #[error("Origin {origin} is not permitted to use account {address}")]
    Authorization { origin: String, address: String },

    #[error("Chain connection error for chain {chain}: {message}")]
    ChainConnection { chain: String, message: String },

    #[error("Simulation failed: {0}")]
    Simulation(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Nonce error for {address} on chain {chain}: {message}")]
    Nonce {
        chain: String,
        address: String,
        message: String,
    },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Transaction {id} has no hash but is marked as submitted")]
    NoTxHash { id: u64 },

    #[error("Multi-sig transaction expired at {expired_at}, node time is {now}")]
    ExpiredMultiSig { expired_at: u64, now: u64 },

    #[error("Account {signer} is not an owner of this multi-sig transaction")]
    WrongSigner { signer: String },

    #[error("Multi-sig transaction belongs to chain {expected}, current chain is {actual}")]
    WrongChain { expected: String, actual: String },

    #[error("User rejected transaction {id}")]
    UserRejected { id: u64 },

    #[error("Chain {chain} not found")]
    ChainNotFound { chain: String },

    #[error("Transaction {id} not found")]
    TransactionNotFound { id: u64 },

    #[error("Invalid state transition for transaction {id} from {from} to {to}")]
    InvalidStateTransition { id: u64, from: String, to: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Substrings of node errors that are expected when rebroadcasting a transaction the
/// network has already seen or replaced.
const BENIGN_RESUBMIT_ERRORS: &[&str] = &[
    "known transaction",
    "already known",
    "replacement transaction underpriced",
    "transaction underpriced",
    "nonce too low",
    "sequence number too old",
    "gateway timeout",
];

impl TxError {
    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            TxError::NoTxHash { .. } | TxError::Database(_) | TxError::Internal(_)
        )
    }

    /// Errors raised while rebroadcasting that only mean the network already has
    /// this transaction or a replacement for it.
    pub fn is_benign_resubmit_error(&self) -> bool {
        let message = self.to_string().to_lowercase();
        BENIGN_RESUBMIT_ERRORS
            .iter()
            .any(|needle| message.contains(needle))
    }

    /// The node already holds this exact transaction in its pool
    pub fn is_already_known(&self) -> bool {
        let message = self.to_string().to_lowercase();
        message.contains("already known") || message.contains("known transaction")
    }
}

/// Result type for engine operations
pub type TxResult<T> = Result<T, TxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_resubmit_errors() {
        let known = TxError::Publish("Known transaction: 0xabc".to_string());
        assert!(known.is_benign_resubmit_error());

        let underpriced = TxError::ChainConnection {
            chain: "eth:1".to_string(),
            message: "replacement transaction underpriced".to_string(),
        };
        assert!(underpriced.is_benign_resubmit_error());

        let timeout = TxError::Publish("504 Gateway Timeout".to_string());
        assert!(timeout.is_benign_resubmit_error());

        let real = TxError::Publish("insufficient funds for gas * price + value".to_string());
        assert!(!real.is_benign_resubmit_error());
    }

    #[test]
    fn test_already_known_classification() {
        assert!(TxError::Publish("already known".to_string()).is_already_known());
        assert!(TxError::Publish("Known transaction: 0xabc".to_string()).is_already_known());
        assert!(!TxError::Publish("nonce too low".to_string()).is_already_known());
    }
}
