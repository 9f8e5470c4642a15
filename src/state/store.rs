//! In-memory transaction store, the single source of truth for record state

use super::record::{
    MultiSigState, TransactionRecord, TxFilter, TxReceipt, TxStatus,
};
use crate::error::{TxError, TxResult};
use crate::events::{TxEvent, TxOutcome};

use chrono::Utc;
use dashmap::DashMap;
use ethers::types::{Address, H256};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, oneshot, RwLock};
use tracing::debug;

/// Observable table of transaction records
pub struct TransactionStore {
    /// Records in insertion order (oldest first)
    transactions: RwLock<Vec<TransactionRecord>>,
    /// Next id to hand out
    next_id: AtomicU64,
    /// Maximum number of records retained
    history_limit: usize,
    /// Event broadcast channel
    event_tx: broadcast::Sender<TxEvent>,
    /// One-shot completion signals keyed by record id
    waiters: DashMap<u64, Vec<oneshot::Sender<TxOutcome>>>,
}

impl TransactionStore {
    /// Create an empty store
    pub fn new(history_limit: usize) -> Self {
        let (event_tx, _) = broadcast::channel(4096);
        Self {
            transactions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            history_limit,
            event_tx,
            waiters: DashMap::new(),
        }
    }

    /// Subscribe to store events
    pub fn subscribe(&self) -> broadcast::Receiver<TxEvent> {
        self.event_tx.subscribe()
    }

    /// Publish an event on the store channel
    pub fn emit(&self, event: TxEvent) {
        // No receivers is fine
        let _ = self.event_tx.send(event);
    }

    /// Reload persisted records, replacing the current contents
    pub async fn restore(&self, mut records: Vec<TransactionRecord>) {
        records.sort_by_key(|r| r.id);
        let next = records.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        *self.transactions.write().await = records;
        self.next_id.store(next, Ordering::SeqCst);
    }

    /// Insert a new record, assigning its id
    pub async fn add_tx(&self, mut record: TransactionRecord) -> TxResult<TransactionRecord> {
        let mut txs = self.transactions.write().await;

        record.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        record.push_history("added");
        let snapshot = record.clone();
        txs.push(record);
        self.emit(TxEvent::Updated {
            id: snapshot.id,
            note: "added".to_string(),
        });

        self.prune(&mut txs);
        debug!("Added transaction {} ({})", snapshot.id, snapshot.status);
        Ok(snapshot)
    }

    /// Drop the oldest terminal records once the history limit is exceeded
    fn prune(&self, txs: &mut Vec<TransactionRecord>) {
        while txs.len() > self.history_limit {
            let Some(index) = txs.iter().position(|t| t.status.is_terminal()) else {
                break;
            };
            let removed = txs.remove(index);
            self.emit(TxEvent::Removed { id: removed.id });
        }
    }

    /// Replace the non-status fields of a record
    pub async fn update_tx(&self, record: &TransactionRecord, note: &str) -> TxResult<()> {
        let mut txs = self.transactions.write().await;
        let stored = txs
            .iter_mut()
            .find(|t| t.id == record.id)
            .ok_or(TxError::TransactionNotFound { id: record.id })?;

        if stored.status.is_terminal() {
            return Err(TxError::InvalidStateTransition {
                id: record.id,
                from: stored.status.to_string(),
                to: "updated".to_string(),
            });
        }
        if stored.status != record.status || stored.hash != record.hash {
            return Err(TxError::Internal(format!(
                "status and hash of transaction {} can only change through a status transition",
                record.id
            )));
        }
        if stored.from() != record.from()
            || stored.chain != record.chain
            || stored.origin != record.origin
            || stored.tx_type != record.tx_type
            || stored.original_tx_id != record.original_tx_id
        {
            return Err(TxError::Validation(format!(
                "sender, chain, origin and type of transaction {} are fixed once added",
                record.id
            )));
        }

        let history = std::mem::take(&mut stored.history);
        *stored = record.clone();
        stored.history = history;
        stored.push_history(note);

        self.emit(TxEvent::Updated {
            id: record.id,
            note: note.to_string(),
        });
        Ok(())
    }

    /// Get a record by id
    pub async fn get_tx(&self, id: u64) -> Option<TransactionRecord> {
        self.transactions
            .read()
            .await
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    /// Get all records matching `filter`
    pub async fn get_filtered_tx_list(&self, filter: &TxFilter) -> Vec<TransactionRecord> {
        self.transactions
            .read()
            .await
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect()
    }

    async fn by_status(&self, status: TxStatus, address: Option<Address>) -> Vec<TransactionRecord> {
        self.get_filtered_tx_list(&TxFilter {
            status: Some(status),
            from: address,
            ..Default::default()
        })
        .await
    }

    /// Submitted transactions awaiting confirmation
    pub async fn get_pending_transactions(&self, address: Option<Address>) -> Vec<TransactionRecord> {
        self.by_status(TxStatus::Submitted, address).await
    }

    pub async fn get_approved_transactions(&self, address: Option<Address>) -> Vec<TransactionRecord> {
        self.by_status(TxStatus::Approved, address).await
    }

    pub async fn get_confirmed_transactions(&self, address: Option<Address>) -> Vec<TransactionRecord> {
        self.by_status(TxStatus::Confirmed, address).await
    }

    pub async fn get_unapproved_tx_list(&self) -> Vec<TransactionRecord> {
        self.by_status(TxStatus::Unapproved, None).await
    }

    pub async fn get_unknown_transactions(&self) -> Vec<TransactionRecord> {
        self.by_status(TxStatus::Unknown, None).await
    }

    /// Register interest in the outcome of a record.
    ///
    /// The receiver resolves once the record is submitted, rejected or failed. If it
    /// already is, the receiver is ready immediately.
    pub async fn wait_for_outcome(&self, id: u64) -> TxResult<oneshot::Receiver<TxOutcome>> {
        let txs = self.transactions.read().await;
        let record = txs
            .iter()
            .find(|t| t.id == id)
            .ok_or(TxError::TransactionNotFound { id })?;

        let (tx, rx) = oneshot::channel();
        match TxOutcome::from_record(record) {
            Some(outcome) => {
                let _ = tx.send(outcome);
            }
            None => self.waiters.entry(id).or_default().push(tx),
        }
        Ok(rx)
    }

    fn resolve_waiters(&self, id: u64, outcome: TxOutcome) {
        if let Some((_, waiters)) = self.waiters.remove(&id) {
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    /// Apply a status transition, emit events and fulfil completion signals
    async fn transition<F>(
        &self,
        id: u64,
        to: TxStatus,
        note: &str,
        extra_from: &[TxStatus],
        mutate: F,
    ) -> TxResult<TransactionRecord>
    where
        F: FnOnce(&mut TransactionRecord),
    {
        let mut txs = self.transactions.write().await;
        let record = txs
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(TxError::TransactionNotFound { id })?;

        let from = record.status;
        let allowed = from.can_transition_to(to) || extra_from.contains(&from);
        if !allowed {
            return Err(TxError::InvalidStateTransition {
                id,
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        record.status = to;
        mutate(record);
        record.push_history(note);
        let snapshot = record.clone();

        debug!("Transaction {} {} -> {}", id, from, to);

        // Emitted under the write lock so per-id delivery order follows mutation order
        self.emit(TxEvent::StatusUpdate { id, status: to });
        match to {
            TxStatus::Confirmed => {
                if let Some(receipt) = snapshot.receipt.clone() {
                    self.emit(TxEvent::Confirmed { id, receipt });
                }
            }
            TxStatus::Dropped => self.emit(TxEvent::Dropped { id }),
            TxStatus::Failed => self.emit(TxEvent::Failed {
                id,
                error: snapshot.err.clone().unwrap_or_default(),
            }),
            TxStatus::Unknown => self.emit(TxEvent::Unknown { id }),
            _ => {}
        }

        if let Some(outcome) = TxOutcome::from_record(&snapshot) {
            self.resolve_waiters(id, outcome);
        }

        Ok(snapshot)
    }

    pub async fn set_tx_status_approved(&self, id: u64) -> TxResult<TransactionRecord> {
        self.transition(id, TxStatus::Approved, "approved", &[], |_| {})
            .await
    }

    pub async fn set_tx_status_rejected(&self, id: u64) -> TxResult<TransactionRecord> {
        self.transition(id, TxStatus::Rejected, "rejected by user", &[], |_| {})
            .await
    }

    /// Park a partially signed multi-sig transaction until more signatures arrive
    pub async fn set_tx_status_multisign_pending(
        &self,
        id: u64,
        multisig: MultiSigState,
    ) -> TxResult<TransactionRecord> {
        self.transition(
            id,
            TxStatus::MultiSignPending,
            "awaiting co-signatures",
            &[],
            |record| {
                record.tx_params.multisig_payload = multisig.partial_payload.clone();
                record.multisig = Some(multisig);
            },
        )
        .await
    }

    pub async fn set_tx_status_submitted(&self, id: u64, hash: H256) -> TxResult<TransactionRecord> {
        self.transition(id, TxStatus::Submitted, "submitted", &[], |record| {
            record.hash = Some(hash);
            if record.submitted_time.is_none() {
                record.submitted_time = Some(Utc::now());
            }
        })
        .await
    }

    pub async fn set_tx_status_confirmed(
        &self,
        id: u64,
        receipt: TxReceipt,
    ) -> TxResult<TransactionRecord> {
        self.transition(id, TxStatus::Confirmed, "confirmed", &[], |record| {
            record.receipt = Some(receipt);
            record.warning = None;
        })
        .await
    }

    pub async fn set_tx_status_dropped(&self, id: u64) -> TxResult<TransactionRecord> {
        self.transition(id, TxStatus::Dropped, "dropped", &[], |_| {})
            .await
    }

    /// Drop a record whose nonce was consumed by a confirmed sibling.
    ///
    /// Unlike the other transitions this one may also overwrite an approved,
    /// multi-sign-pending or failed record.
    pub async fn set_tx_status_dropped_sibling(
        &self,
        id: u64,
        replaced_by: Option<H256>,
    ) -> TxResult<TransactionRecord> {
        self.transition(
            id,
            TxStatus::Dropped,
            "dropped: nonce used by sibling",
            &[TxStatus::Approved, TxStatus::MultiSignPending, TxStatus::Failed],
            |record| record.replaced_by = replaced_by,
        )
        .await
    }

    pub async fn set_tx_status_failed(
        &self,
        id: u64,
        message: impl Into<String>,
    ) -> TxResult<TransactionRecord> {
        let message = message.into();
        self.transition(id, TxStatus::Failed, "failed", &[], |record| {
            record.err = Some(message);
        })
        .await
    }

    pub async fn set_tx_status_unknown(&self, id: u64) -> TxResult<TransactionRecord> {
        self.transition(id, TxStatus::Unknown, "pending too long, status unknown", &[], |_| {})
            .await
    }

    /// Move an unknown record back under tracker supervision
    pub async fn set_tx_status_resumed(&self, id: u64) -> TxResult<TransactionRecord> {
        self.transition(id, TxStatus::Submitted, "resumed tracking", &[], |_| {})
            .await
    }

    /// Put a multi-sig record back in the approval queue after new signatures arrive
    pub async fn set_tx_status_reapproved(
        &self,
        id: u64,
        multisig: MultiSigState,
    ) -> TxResult<TransactionRecord> {
        self.transition(id, TxStatus::Approved, "co-signatures added", &[], |record| {
            record.tx_params.multisig_payload = multisig.partial_payload.clone();
            record.multisig = Some(multisig);
        })
        .await
    }

    /// Remove every record sent from `address`
    pub async fn wipe_transactions(&self, address: Address) -> usize {
        self.remove_where(|t| t.from() == address, "transaction history wiped")
            .await
    }

    /// Remove all unapproved records, e.g. after a network switch
    pub async fn clear_unapproved_txs(&self) -> usize {
        self.remove_where(
            |t| t.status == TxStatus::Unapproved,
            "unapproved transaction cleared",
        )
        .await
    }

    async fn remove_where<P>(&self, predicate: P, reason: &str) -> usize
    where
        P: Fn(&TransactionRecord) -> bool,
    {
        let mut txs = self.transactions.write().await;
        let (removed, kept): (Vec<_>, Vec<_>) = txs.drain(..).partition(|t| predicate(t));
        *txs = kept;

        for record in &removed {
            self.emit(TxEvent::Removed { id: record.id });
            self.resolve_waiters(record.id, TxOutcome::Failed(reason.to_string()));
        }
        removed.len()
    }
}
