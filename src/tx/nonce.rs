//! Nonce allocation for reliable transaction submission
//!
//! Handles:
//! - Per (chain, address) serialization of nonce issuance
//! - Reconciling the network's next nonce with locally tracked transactions
//! - A global lock held while the pending-transaction scan runs

use crate::chain::ChainRegistry;
use crate::error::TxResult;
use crate::state::{ChainSelector, NonceDetails, TransactionStore, TxFilter, TxStatus};

use dashmap::DashMap;
use ethers::types::Address;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Statuses whose nonce is already claimed locally
const NONCE_CLAIMING: [TxStatus; 3] = [
    TxStatus::Submitted,
    TxStatus::Approved,
    TxStatus::MultiSignPending,
];

/// Exclusive claim on the next nonce of an account.
///
/// The per-address lock is released by [`NonceLock::release`] or when the lock is dropped.
#[derive(Debug)]
pub struct NonceLock {
    pub address: Address,
    pub chain: ChainSelector,
    pub next_nonce: u64,
    pub nonce_details: NonceDetails,
    guard: Option<OwnedMutexGuard<()>>,
}

impl NonceLock {
    pub fn release(mut self) {
        if self.guard.take().is_some() {
            debug!("Released nonce lock for {:?} on {}", self.address, self.chain);
        }
    }
}

/// Hands out nonces across chains and accounts
pub struct NonceTracker {
    store: Arc<TransactionStore>,
    chains: Arc<ChainRegistry>,
    /// Per (chain, address) issuance locks
    address_locks: DashMap<(ChainSelector, Address), Arc<Mutex<()>>>,
    global_lock: Arc<Mutex<()>>,
}

impl NonceTracker {
    pub fn new(store: Arc<TransactionStore>, chains: Arc<ChainRegistry>) -> Self {
        Self {
            store,
            chains,
            address_locks: DashMap::new(),
            global_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Lock held for the duration of a full pending-transaction scan
    pub async fn get_global_lock(&self) -> OwnedMutexGuard<()> {
        self.global_lock.clone().lock_owned().await
    }

    /// Reserve the next nonce for `address` on `chain`
    pub async fn get_nonce_lock(&self, address: Address, chain: &ChainSelector) -> TxResult<NonceLock> {
        // Wait for any running scan to finish before issuing
        drop(self.global_lock.lock().await);

        let lock = self
            .address_locks
            .entry((chain.clone(), address))
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;

        // Errors below drop the guard and release the address lock
        let adapter = self.chains.get(chain)?;
        let network_reported = adapter.account_sequence_number(address).await?;
        let local_highest = self.highest_local_nonce(address, chain).await;

        let next_nonce = match local_highest {
            Some(highest) => std::cmp::max(network_reported, highest + 1),
            None => network_reported,
        };

        debug!(
            "Allocated nonce {} for {:?} on {} (network {}, local {:?})",
            next_nonce, address, chain, network_reported, local_highest
        );

        Ok(NonceLock {
            address,
            chain: chain.clone(),
            next_nonce,
            nonce_details: NonceDetails {
                local_highest,
                network_reported,
            },
            guard: Some(guard),
        })
    }

    async fn highest_local_nonce(&self, address: Address, chain: &ChainSelector) -> Option<u64> {
        self.store
            .get_filtered_tx_list(&TxFilter {
                from: Some(address),
                chain: Some(chain.clone()),
                ..Default::default()
            })
            .await
            .iter()
            .filter(|t| NONCE_CLAIMING.contains(&t.status))
            .filter_map(|t| t.nonce())
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainAdapter;
    use crate::state::{TransactionRecord, TxParams, TxType};
    use ethers::types::H256;
    use std::time::Duration;

    fn setup(network_nonce: u64) -> (Arc<TransactionStore>, NonceTracker) {
        let mut adapter = MockChainAdapter::new();
        adapter
            .expect_account_sequence_number()
            .returning(move |_| Ok(network_nonce));

        let chains = Arc::new(ChainRegistry::new());
        chains.register(ChainSelector::from("eth:1"), Arc::new(adapter));

        let store = Arc::new(TransactionStore::new(100));
        let tracker = NonceTracker::new(store.clone(), chains);
        (store, tracker)
    }

    async fn submit(store: &TransactionStore, from: Address, nonce: u64) {
        let tx = store
            .add_tx(TransactionRecord::new(
                ChainSelector::from("eth:1"),
                TxType::Transfer,
                TxParams {
                    from,
                    nonce: Some(nonce),
                    ..Default::default()
                },
                "internal",
            ))
            .await
            .unwrap();
        store.set_tx_status_approved(tx.id).await.unwrap();
        store
            .set_tx_status_submitted(tx.id, H256::from_low_u64_be(tx.id))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_uses_network_nonce_without_local_history() {
        let (_, tracker) = setup(3);
        let lock = tracker
            .get_nonce_lock(Address::repeat_byte(1), &ChainSelector::from("eth:1"))
            .await
            .unwrap();
        assert_eq!(lock.next_nonce, 3);
        assert_eq!(lock.nonce_details.local_highest, None);
        assert_eq!(lock.nonce_details.network_reported, 3);
    }

    #[tokio::test]
    async fn test_local_pending_nonce_wins_over_stale_network() {
        let from = Address::repeat_byte(2);
        let (store, tracker) = setup(5);
        submit(&store, from, 5).await;

        let lock = tracker
            .get_nonce_lock(from, &ChainSelector::from("eth:1"))
            .await
            .unwrap();
        assert_eq!(lock.next_nonce, 6);
        assert_eq!(lock.nonce_details.local_highest, Some(5));
    }

    #[tokio::test]
    async fn test_address_lock_serializes_issuance() {
        let from = Address::repeat_byte(3);
        let (_, tracker) = setup(0);
        let tracker = Arc::new(tracker);
        let chain = ChainSelector::from("eth:1");

        let first = tracker.get_nonce_lock(from, &chain).await.unwrap();

        let waiting = tokio::spawn({
            let tracker = tracker.clone();
            let chain = chain.clone();
            async move { tracker.get_nonce_lock(from, &chain).await.map(|l| l.next_nonce) }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        first.release();
        let second = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn test_drop_releases_lock() {
        let from = Address::repeat_byte(4);
        let (_, tracker) = setup(1);
        let chain = ChainSelector::from("eth:1");

        {
            let _lock = tracker.get_nonce_lock(from, &chain).await.unwrap();
        }

        let relock = tokio::time::timeout(
            Duration::from_millis(200),
            tracker.get_nonce_lock(from, &chain),
        )
        .await;
        assert!(relock.is_ok());
    }

    #[tokio::test]
    async fn test_allocation_waits_for_global_lock() {
        let (_, tracker) = setup(0);
        let chain = ChainSelector::from("eth:1");

        let scan = tracker.get_global_lock().await;
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            tracker.get_nonce_lock(Address::repeat_byte(5), &chain),
        )
        .await;
        assert!(blocked.is_err());

        drop(scan);
        assert!(tracker
            .get_nonce_lock(Address::repeat_byte(5), &chain)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_unknown_chain_fails_without_holding_lock() {
        let (_, tracker) = setup(0);
        let from = Address::repeat_byte(6);
        let missing = ChainSelector::from("ledger:missing");

        assert!(tracker.get_nonce_lock(from, &missing).await.is_err());
        assert!(tokio::time::timeout(
            Duration::from_millis(200),
            tracker.get_nonce_lock(from, &missing)
        )
        .await
        .is_ok());
    }
}
