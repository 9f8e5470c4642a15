//! Pending transaction tracker
//!
//! On every new block the tracker checks submitted transactions for receipts,
//! detects transactions the network has dropped and rebroadcasts stragglers with
//! exponential backoff. It only reads the store; findings are returned as
//! [`TrackerEvent`]s for the controller to apply in order.

use crate::chain::{ChainAdapter, ChainRegistry};
use crate::error::TxError;
use crate::state::{
    ChainSelector, TransactionRecord, TransactionStore, TxFilter, TxReceipt, TxStatus,
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use ethers::types::H256;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

const RECEIPT_WARNING: &str = "There was a problem loading this transaction.";
const SHARED_NONCE_WARNING: &str =
    "Another pending transaction shares this nonce; waiting for it before marking this one dropped.";

/// Finding about a tracked transaction
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    Confirmed { id: u64, receipt: TxReceipt },
    Failed { id: u64, error: String },
    Dropped { id: u64 },
    /// Non-fatal problem, the record stays where it is
    Warning { id: u64, error: String, message: String },
    /// First block seen since submission; starts the resubmission clock
    BlockUpdate { id: u64, block_height: u64 },
    /// Raw bytes were rebroadcast (or a rebroadcast was attempted)
    Retry { id: u64 },
    /// Pending for longer than the offline timeout
    Unknown { id: u64 },
    /// Unknown record is pending again
    Resumed { id: u64 },
}

impl TrackerEvent {
    pub fn id(&self) -> u64 {
        match self {
            TrackerEvent::Confirmed { id, .. }
            | TrackerEvent::Failed { id, .. }
            | TrackerEvent::Dropped { id }
            | TrackerEvent::Warning { id, .. }
            | TrackerEvent::BlockUpdate { id, .. }
            | TrackerEvent::Retry { id }
            | TrackerEvent::Unknown { id }
            | TrackerEvent::Resumed { id } => *id,
        }
    }
}

/// Watches submitted transactions until they settle
pub struct PendingTransactionTracker {
    store: Arc<TransactionStore>,
    chains: Arc<ChainRegistry>,
    /// Consecutive "network nonce passed us" observations per hash
    dropped_buffer: DashMap<H256, u32>,
    dropped_buffer_count: u32,
}

impl PendingTransactionTracker {
    pub fn new(store: Arc<TransactionStore>, chains: Arc<ChainRegistry>, dropped_buffer_count: u32) -> Self {
        Self {
            store,
            chains,
            dropped_buffer: DashMap::new(),
            dropped_buffer_count,
        }
    }

    /// Check every submitted transaction on `chain` once
    pub async fn update_pending_txs(&self, chain: &ChainSelector) -> Vec<TrackerEvent> {
        self.prune_dropped_buffer().await;

        let pending = self.pending_on(chain).await;
        if pending.is_empty() {
            return Vec::new();
        }

        let adapter = match self.chains.get(chain) {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("Cannot track transactions on {}: {}", chain, e);
                return Vec::new();
            }
        };

        let confirmed = self
            .store
            .get_filtered_tx_list(&TxFilter {
                chain: Some(chain.clone()),
                status: Some(TxStatus::Confirmed),
                ..Default::default()
            })
            .await;

        let mut events = Vec::new();
        for record in &pending {
            if let Some(event) = self
                .check_pending_tx(adapter.as_ref(), record, &pending, &confirmed)
                .await
            {
                debug!("Tracker: {:?}", event);
                events.push(event);
            }
        }
        events
    }

    async fn check_pending_tx(
        &self,
        adapter: &dyn ChainAdapter,
        record: &TransactionRecord,
        pending: &[TransactionRecord],
        confirmed: &[TransactionRecord],
    ) -> Option<TrackerEvent> {
        let Some(hash) = record.hash else {
            return Some(TrackerEvent::Failed {
                id: record.id,
                error: TxError::NoTxHash { id: record.id }.to_string(),
            });
        };

        if confirmed.iter().any(|c| c.shares_nonce_with(record)) {
            self.dropped_buffer.remove(&hash);
            return Some(TrackerEvent::Dropped { id: record.id });
        }

        match adapter.get_receipt(hash).await {
            Ok(Some(receipt)) => {
                self.dropped_buffer.remove(&hash);
                if receipt.success == Some(false) {
                    return Some(TrackerEvent::Failed {
                        id: record.id,
                        error: format!("Transaction failed on chain in block {}", receipt.block_number),
                    });
                }
                return Some(TrackerEvent::Confirmed {
                    id: record.id,
                    receipt,
                });
            }
            Ok(None) => {}
            Err(e) => {
                return Some(TrackerEvent::Warning {
                    id: record.id,
                    error: e.to_string(),
                    message: RECEIPT_WARNING.to_string(),
                });
            }
        }

        self.check_dropped(adapter, record, hash, pending).await
    }

    /// Count one observation towards the drop threshold
    async fn check_dropped(
        &self,
        adapter: &dyn ChainAdapter,
        record: &TransactionRecord,
        hash: H256,
        pending: &[TransactionRecord],
    ) -> Option<TrackerEvent> {
        let nonce = record.nonce()?;

        let network_nonce = match adapter.account_sequence_number(record.from()).await {
            Ok(n) => n,
            Err(e) => {
                return Some(TrackerEvent::Warning {
                    id: record.id,
                    error: e.to_string(),
                    message: RECEIPT_WARNING.to_string(),
                });
            }
        };

        if network_nonce <= nonce {
            // Observations must be consecutive
            self.dropped_buffer.remove(&hash);
            return None;
        }

        let count = {
            let mut entry = self.dropped_buffer.entry(hash).or_insert(0);
            *entry += 1;
            *entry
        };
        if count < self.dropped_buffer_count {
            debug!(
                "Transaction {} nonce {} passed by network ({}), observation {}/{}",
                record.id, nonce, network_nonce, count, self.dropped_buffer_count
            );
            return None;
        }

        let sibling_still_counting = pending.iter().any(|p| {
            p.shares_nonce_with(record)
                && p
                    .hash
                    .map(|h| self.observations(&h) < self.dropped_buffer_count)
                    .unwrap_or(false)
        });
        if sibling_still_counting {
            return Some(TrackerEvent::Warning {
                id: record.id,
                error: format!("nonce {} shared with a pending transaction", nonce),
                message: SHARED_NONCE_WARNING.to_string(),
            });
        }

        self.dropped_buffer.remove(&hash);
        info!("Transaction {} dropped after {} observations", record.id, count);
        Some(TrackerEvent::Dropped { id: record.id })
    }

    /// Forget counters of hashes no longer submitted on any chain
    async fn prune_dropped_buffer(&self) {
        if self.dropped_buffer.is_empty() {
            return;
        }
        let live: HashSet<H256> = self
            .store
            .get_pending_transactions(None)
            .await
            .into_iter()
            .filter_map(|t| t.hash)
            .collect();
        self.dropped_buffer.retain(|hash, _| live.contains(hash));
    }

    #[cfg(test)]
    fn tracked_observations(&self) -> usize {
        self.dropped_buffer.len()
    }

    fn observations(&self, hash: &H256) -> u32 {
        self.dropped_buffer.get(hash).map(|c| *c).unwrap_or(0)
    }

    /// Rebroadcast submitted transactions whose backoff window has elapsed
    pub async fn resubmit_pending_txs(&self, chain: &ChainSelector, block_height: u64) -> Vec<TrackerEvent> {
        let pending = self.pending_on(chain).await;
        if pending.is_empty() {
            return Vec::new();
        }

        let adapter = match self.chains.get(chain) {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("Cannot resubmit transactions on {}: {}", chain, e);
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        for record in pending {
            let Some(raw) = record.raw_signed.as_ref() else {
                debug!("Transaction {} has no raw bytes, not resubmitting", record.id);
                continue;
            };

            let Some(first) = record.first_retry_block_height else {
                events.push(TrackerEvent::BlockUpdate {
                    id: record.id,
                    block_height,
                });
                continue;
            };

            if !resubmit_due(first, record.retry_count, block_height) {
                continue;
            }

            events.push(TrackerEvent::Retry { id: record.id });
            match adapter.broadcast(raw).await {
                Ok(hash) => debug!("Rebroadcast transaction {} as {:?}", record.id, hash),
                Err(e) if e.is_benign_resubmit_error() => {
                    debug!("Ignoring rebroadcast error for {}: {}", record.id, e);
                }
                Err(e) => {
                    warn!("Rebroadcast of transaction {} failed: {}", record.id, e);
                    events.push(TrackerEvent::Warning {
                        id: record.id,
                        error: e.to_string(),
                        message: "There was an error when resubmitting this transaction.".to_string(),
                    });
                }
            }
        }
        events
    }

    /// Flag transactions on `chain` that have been pending for longer than `timeout`
    pub async fn check_offline_txs(
        &self,
        chain: &ChainSelector,
        now: DateTime<Utc>,
        timeout: ChronoDuration,
    ) -> Vec<TrackerEvent> {
        self.pending_on(chain)
            .await
            .into_iter()
            .filter(|t| t.submitted_time.map_or(false, |sent| now - sent > timeout))
            .map(|t| TrackerEvent::Unknown { id: t.id })
            .collect()
    }

    /// Re-query unknown transactions on `chain`
    pub async fn check_unknown_txs(&self, chain: &ChainSelector) -> Vec<TrackerEvent> {
        let unknown = self
            .store
            .get_filtered_tx_list(&TxFilter {
                chain: Some(chain.clone()),
                status: Some(TxStatus::Unknown),
                ..Default::default()
            })
            .await;
        if unknown.is_empty() {
            return Vec::new();
        }

        let adapter = match self.chains.get(chain) {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("Cannot query unknown transactions on {}: {}", chain, e);
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        for record in unknown {
            let event = self.check_unknown_tx(adapter.as_ref(), &record).await;
            events.push(event);
        }
        events
    }

    async fn check_unknown_tx(&self, adapter: &dyn ChainAdapter, record: &TransactionRecord) -> TrackerEvent {
        let Some(hash) = record.hash else {
            return TrackerEvent::Failed {
                id: record.id,
                error: TxError::NoTxHash { id: record.id }.to_string(),
            };
        };

        match adapter.get_receipt(hash).await {
            Ok(Some(receipt)) if receipt.success == Some(false) => {
                return TrackerEvent::Failed {
                    id: record.id,
                    error: format!("Transaction failed on chain in block {}", receipt.block_number),
                };
            }
            Ok(Some(receipt)) => {
                return TrackerEvent::Confirmed {
                    id: record.id,
                    receipt,
                }
            }
            Ok(None) => {}
            Err(e) => {
                return TrackerEvent::Warning {
                    id: record.id,
                    error: e.to_string(),
                    message: RECEIPT_WARNING.to_string(),
                }
            }
        }

        // Drop detection needs consecutive observations, made by the submitted pass
        debug!("Transaction {} has no receipt yet, tracking it again", record.id);
        TrackerEvent::Resumed { id: record.id }
    }

    async fn pending_on(&self, chain: &ChainSelector) -> Vec<TransactionRecord> {
        self.store
            .get_filtered_tx_list(&TxFilter {
                chain: Some(chain.clone()),
                status: Some(TxStatus::Submitted),
                ..Default::default()
            })
            .await
    }
}

/// Whether the exponential backoff window since `first_retry_block_height` has elapsed
pub fn resubmit_due(first_retry_block_height: u64, retry_count: u32, block_height: u64) -> bool {
    let blocks_since = block_height.saturating_sub(first_retry_block_height);
    let retry_after = 2u64.saturating_pow(retry_count);
    blocks_since >= retry_after
}
