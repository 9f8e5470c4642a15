//! Transaction state: records, the in-memory store and PostgreSQL persistence
//!
//! Handles:
//! - Transaction records and their status state machine
//! - The observable in-memory store every component reads and writes through
//! - Snapshot persistence for restart recovery

mod manager;
mod record;
mod store;

pub use manager::StateManager;
pub use record::{
    ChainSelector, HistoryEntry, MultiSigState, NonceDetails, SimulationFailure,
    TransactionRecord, TxFilter, TxParams, TxReceipt, TxStatus, TxType, TxWarning,
};
pub use store::TransactionStore;
