//! Transaction records and the status state machine

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifies which ledger a transaction belongs to (e.g. `eth:1`, `ledger:mainnet`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainSelector(pub String);

impl ChainSelector {
    pub fn new(selector: impl Into<String>) -> Self {
        Self(selector.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChainSelector {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle status of a transaction record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Unapproved,
    Approved,
    MultiSignPending,
    Submitted,
    Confirmed,
    Dropped,
    Failed,
    Unknown,
    Rejected,
}

impl TxStatus {
    /// Terminal statuses never change again, except for the sibling drop path.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TxStatus::Confirmed | TxStatus::Dropped | TxStatus::Failed | TxStatus::Rejected
        )
    }

    pub fn can_transition_to(&self, next: TxStatus) -> bool {
        use TxStatus::*;
        match self {
            Unapproved => matches!(next, Approved | Rejected | Failed),
            Approved => matches!(next, MultiSignPending | Submitted | Failed),
            MultiSignPending => matches!(next, Approved | Submitted | Failed | Rejected),
            Submitted => matches!(next, Confirmed | Dropped | Failed | Unknown),
            Unknown => matches!(next, Submitted | Confirmed | Dropped | Failed),
            Confirmed | Dropped | Failed | Rejected => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Unapproved => "unapproved",
            TxStatus::Approved => "approved",
            TxStatus::MultiSignPending => "multi_sign_pending",
            TxStatus::Submitted => "submitted",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Dropped => "dropped",
            TxStatus::Failed => "failed",
            TxStatus::Unknown => "unknown",
            TxStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a transaction does, derived from the shape of its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Transfer,
    TokenTransfer,
    ContractCall,
    Deploy,
    Cancel,
    Retry,
    Swap,
}

impl TxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxType::Transfer => "transfer",
            TxType::TokenTransfer => "token_transfer",
            TxType::ContractCall => "contract_call",
            TxType::Deploy => "deploy",
            TxType::Cancel => "cancel",
            TxType::Retry => "retry",
            TxType::Swap => "swap",
        }
    }

    /// Cancel and speed-up records legitimately share a nonce with the record they replace.
    pub fn is_replacement(&self) -> bool {
        matches!(self, TxType::Cancel | TxType::Retry)
    }
}

/// Normalized transaction parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxParams {
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub nonce: Option<u64>,
    pub gas_limit: Option<U256>,
    pub gas_price: Option<U256>,
    /// Partially signed multi-sig payload collected from co-signers
    pub multisig_payload: Option<Bytes>,
    pub expiration_timestamp_secs: Option<u64>,
}

/// How a nonce was derived, kept for debugging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceDetails {
    pub local_highest: Option<u64>,
    pub network_reported: u64,
}

/// Diagnostic attached when the dry run of a transaction failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationFailure {
    pub reason: String,
    pub debug: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiSigState {
    pub threshold: u32,
    pub signatures: u32,
    pub partial_payload: Option<Bytes>,
    pub owners: Vec<Address>,
    pub expiration_timestamp_secs: Option<u64>,
}

impl MultiSigState {
    pub fn is_complete(&self) -> bool {
        self.signatures >= self.threshold
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub transaction_hash: H256,
    pub block_number: u64,
    pub gas_used: Option<U256>,
    /// Explicit execution flag, reported by ledgers that include failed transactions in blocks
    pub success: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxWarning {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub note: String,
    pub status: TxStatus,
    pub timestamp: DateTime<Utc>,
}

/// A single transaction tracked by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: u64,
    pub time: DateTime<Utc>,
    pub chain: ChainSelector,
    pub tx_type: TxType,
    pub status: TxStatus,
    pub tx_params: TxParams,
    pub origin: String,
    pub hash: Option<H256>,
    pub raw_signed: Option<Bytes>,
    pub retry_count: u32,
    pub first_retry_block_height: Option<u64>,
    pub simulation_failure: Option<SimulationFailure>,
    pub resource_deltas: Option<BTreeMap<String, U256>>,
    pub nonce_details: Option<NonceDetails>,
    pub custom_nonce: Option<u64>,
    pub multisig: Option<MultiSigState>,
    pub receipt: Option<TxReceipt>,
    pub submitted_time: Option<DateTime<Utc>>,
    pub last_gas_price: Option<U256>,
    pub original_tx_id: Option<u64>,
    pub replaced_by: Option<H256>,
    pub err: Option<String>,
    pub warning: Option<TxWarning>,
    pub history: Vec<HistoryEntry>,
}

impl TransactionRecord {
    /// Build an unapproved record. The store assigns the id.
    pub fn new(
        chain: ChainSelector,
        tx_type: TxType,
        tx_params: TxParams,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            time: Utc::now(),
            chain,
            tx_type,
            status: TxStatus::Unapproved,
            tx_params,
            origin: origin.into(),
            hash: None,
            raw_signed: None,
            retry_count: 0,
            first_retry_block_height: None,
            simulation_failure: None,
            resource_deltas: None,
            nonce_details: None,
            custom_nonce: None,
            multisig: None,
            receipt: None,
            submitted_time: None,
            last_gas_price: None,
            original_tx_id: None,
            replaced_by: None,
            err: None,
            warning: None,
            history: Vec::new(),
        }
    }

    pub fn from(&self) -> Address {
        self.tx_params.from
    }

    pub fn nonce(&self) -> Option<u64> {
        self.tx_params.nonce
    }

    /// A co-signer round on an existing multi-sig payload keeps the original nonce.
    pub fn is_counter_signature(&self) -> bool {
        self.tx_params.multisig_payload.is_some() && self.tx_params.nonce.is_some()
    }

    /// Whether `other` claims the same account nonce on the same ledger.
    pub fn shares_nonce_with(&self, other: &TransactionRecord) -> bool {
        self.id != other.id
            && self.chain == other.chain
            && self.from() == other.from()
            && self.nonce().is_some()
            && self.nonce() == other.nonce()
    }

    pub(crate) fn push_history(&mut self, note: impl Into<String>) {
        self.history.push(HistoryEntry {
            note: note.into(),
            status: self.status,
            timestamp: Utc::now(),
        });
    }
}

/// Field predicates for [`TransactionStore::get_filtered_tx_list`](super::TransactionStore)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TxFilter {
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub status: Option<TxStatus>,
    pub chain: Option<ChainSelector>,
    pub nonce: Option<u64>,
    pub tx_type: Option<TxType>,
    pub hash: Option<H256>,
}

impl TxFilter {
    pub fn matches(&self, record: &TransactionRecord) -> bool {
        self.from.map_or(true, |from| record.from() == from)
            && self.to.map_or(true, |to| record.tx_params.to == Some(to))
            && self.status.map_or(true, |status| record.status == status)
            && self.chain.as_ref().map_or(true, |chain| &record.chain == chain)
            && self.nonce.map_or(true, |nonce| record.nonce() == Some(nonce))
            && self.tx_type.map_or(true, |tx_type| record.tx_type == tx_type)
            && self.hash.map_or(true, |hash| record.hash == Some(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        assert!(TxStatus::Unapproved.can_transition_to(TxStatus::Approved));
        assert!(TxStatus::Unapproved.can_transition_to(TxStatus::Rejected));
        assert!(TxStatus::Approved.can_transition_to(TxStatus::MultiSignPending));
        assert!(TxStatus::MultiSignPending.can_transition_to(TxStatus::Approved));
        assert!(TxStatus::Submitted.can_transition_to(TxStatus::Unknown));
        assert!(!TxStatus::Unapproved.can_transition_to(TxStatus::Submitted));
        assert!(!TxStatus::Approved.can_transition_to(TxStatus::Rejected));

        for terminal in [
            TxStatus::Confirmed,
            TxStatus::Dropped,
            TxStatus::Failed,
            TxStatus::Rejected,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(TxStatus::Submitted));
        }
    }

    #[test]
    fn test_filter_matches() {
        let from = Address::repeat_byte(0x11);
        let mut record = TransactionRecord::new(
            ChainSelector::from("eth:1"),
            TxType::Transfer,
            TxParams {
                from,
                nonce: Some(4),
                ..Default::default()
            },
            "internal",
        );
        record.status = TxStatus::Submitted;

        let filter = TxFilter {
            from: Some(from),
            nonce: Some(4),
            ..Default::default()
        };
        assert!(filter.matches(&record));

        let other_nonce = TxFilter {
            nonce: Some(5),
            ..Default::default()
        };
        assert!(!other_nonce.matches(&record));

        let other_chain = TxFilter {
            chain: Some(ChainSelector::from("ledger:main")),
            ..Default::default()
        };
        assert!(!other_chain.matches(&record));
    }
}
