//! Observer events emitted by the transaction store and controller
//!
//! All events flow through one broadcast channel so that delivery order per
//! record id matches the order of the underlying store mutations.

use crate::state::{TransactionRecord, TxReceipt, TxStatus};

use ethers::types::H256;
use serde::Serialize;

/// Events emitted while transactions move through their lifecycle
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TxEvent {
    /// Any status transition
    StatusUpdate { id: u64, status: TxStatus },

    /// Transaction included on chain
    Confirmed { id: u64, receipt: TxReceipt },

    /// Transaction superseded by another one with the same nonce
    Dropped { id: u64 },

    /// Transaction failed
    Failed { id: u64, error: String },

    /// Non-fatal problem while polling or rebroadcasting
    Warning {
        record: Box<TransactionRecord>,
        error: String,
    },

    /// Transaction was rebroadcast
    Retry { record: Box<TransactionRecord> },

    /// First block observed for a pending transaction
    BlockUpdate {
        record: Box<TransactionRecord>,
        block_height: u64,
    },

    /// Pending for too long without network confirmation
    Unknown { id: u64 },

    /// New request waiting for user approval
    NewUnapproved { id: u64 },

    /// Record fields changed without a status transition
    Updated { id: u64, note: String },

    /// Record deleted from the store
    Removed { id: u64 },
}

impl TxEvent {
    /// Get the record id this event refers to
    pub fn id(&self) -> u64 {
        match self {
            TxEvent::StatusUpdate { id, .. } => *id,
            TxEvent::Confirmed { id, .. } => *id,
            TxEvent::Dropped { id } => *id,
            TxEvent::Failed { id, .. } => *id,
            TxEvent::Warning { record, .. } => record.id,
            TxEvent::Retry { record } => record.id,
            TxEvent::BlockUpdate { record, .. } => record.id,
            TxEvent::Unknown { id } => *id,
            TxEvent::NewUnapproved { id } => *id,
            TxEvent::Updated { id, .. } => *id,
            TxEvent::Removed { id } => *id,
        }
    }

    /// Get event name for metrics and logs
    pub fn name(&self) -> &'static str {
        match self {
            TxEvent::StatusUpdate { .. } => "tx:status-update",
            TxEvent::Confirmed { .. } => "tx:confirmed",
            TxEvent::Dropped { .. } => "tx:dropped",
            TxEvent::Failed { .. } => "tx:failed",
            TxEvent::Warning { .. } => "tx:warning",
            TxEvent::Retry { .. } => "tx:retry",
            TxEvent::BlockUpdate { .. } => "tx:block-update",
            TxEvent::Unknown { .. } => "tx:unknown",
            TxEvent::NewUnapproved { .. } => "tx:new-unapproved",
            TxEvent::Updated { .. } => "tx:updated",
            TxEvent::Removed { .. } => "tx:removed",
        }
    }

    /// Whether the persisted copy of the record must be refreshed
    pub fn changes_record(&self) -> bool {
        !matches!(self, TxEvent::NewUnapproved { .. } | TxEvent::Removed { .. })
    }
}

/// How a request finished from the caller's point of view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    Submitted(H256),
    Rejected,
    Failed(String),
}

impl TxOutcome {
    /// Outcome already reached by `record`, if any
    pub fn from_record(record: &TransactionRecord) -> Option<Self> {
        match record.status {
            TxStatus::Rejected => Some(TxOutcome::Rejected),
            TxStatus::Failed => Some(TxOutcome::Failed(
                record
                    .err
                    .clone()
                    .unwrap_or_else(|| "transaction failed".to_string()),
            )),
            TxStatus::Dropped if record.hash.is_none() => Some(TxOutcome::Failed(
                "transaction was replaced before it was submitted".to_string(),
            )),
            TxStatus::Submitted | TxStatus::Confirmed | TxStatus::Dropped | TxStatus::Unknown => {
                record.hash.map(TxOutcome::Submitted)
            }
            TxStatus::Unapproved | TxStatus::Approved | TxStatus::MultiSignPending => None,
        }
    }
}
