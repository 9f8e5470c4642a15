//! New-block tracking by HTTP polling

use super::ChainAdapter;
use crate::state::ChainSelector;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Source of "new block" notifications for one chain
pub trait BlockTracker: Send + Sync {
    /// Subscribe to new block heights
    fn subscribe(&self) -> broadcast::Receiver<u64>;

    /// Latest height seen so far, without waiting
    fn latest_block(&self) -> Option<u64>;
}

/// Polls a chain adapter for its latest block and broadcasts height changes
pub struct PollingBlockTracker {
    chain: ChainSelector,
    adapter: Arc<dyn ChainAdapter>,
    block_tx: broadcast::Sender<u64>,
    /// Last observed height, 0 until the first successful poll
    latest: AtomicU64,
    poll_interval: Duration,
}

impl PollingBlockTracker {
    pub fn new(chain: ChainSelector, adapter: Arc<dyn ChainAdapter>, poll_interval: Duration) -> Self {
        let (block_tx, _) = broadcast::channel(64);
        Self {
            chain,
            adapter,
            block_tx,
            latest: AtomicU64::new(0),
            poll_interval,
        }
    }

    /// Main polling loop
    pub async fn run(&self) {
        info!(
            "Polling chain {} for new blocks every {:?}",
            self.chain, self.poll_interval
        );

        loop {
            self.poll_once().await;
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Fetch the latest block and broadcast it when the height advanced
    pub async fn poll_once(&self) {
        let block = match self.adapter.latest_block().await {
            Ok(block) => block,
            Err(e) => {
                warn!("Failed to get latest block for {}: {}", self.chain, e);
                return;
            }
        };

        let previous = self.latest.fetch_max(block.number, Ordering::SeqCst);
        if block.number <= previous {
            return;
        }

        debug!("Chain {}: new block {}", self.chain, block.number);
        crate::metrics::record_block_height(&self.chain, block.number);

        // No subscribers while nothing is pending
        let _ = self.block_tx.send(block.number);
    }
}

impl BlockTracker for PollingBlockTracker {
    fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.block_tx.subscribe()
    }

    fn latest_block(&self) -> Option<u64> {
        match self.latest.load(Ordering::SeqCst) {
            0 => None,
            height => Some(height),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{BlockInfo, MockChainAdapter};
    use crate::error::TxError;
    use ethers::types::U256;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_broadcasts_only_new_heights() {
        let calls = Arc::new(AtomicUsize::new(0));
        let heights = [10u64, 10, 11];

        let mut adapter = MockChainAdapter::new();
        let counter = calls.clone();
        adapter.expect_latest_block().returning(move || {
            let i = counter.fetch_add(1, Ordering::SeqCst);
            match heights.get(i) {
                Some(number) => Ok(BlockInfo {
                    number: *number,
                    gas_limit: U256::from(30_000_000u64),
                    timestamp: 1_700_000_000 + i as u64,
                }),
                None => Err(TxError::ChainConnection {
                    chain: "eth:1".to_string(),
                    message: "offline".to_string(),
                }),
            }
        });

        let tracker = PollingBlockTracker::new(
            ChainSelector::from("eth:1"),
            Arc::new(adapter),
            Duration::from_millis(10),
        );
        let mut blocks = tracker.subscribe();
        assert_eq!(tracker.latest_block(), None);

        for _ in 0..4 {
            tracker.poll_once().await;
        }

        assert_eq!(blocks.try_recv().unwrap(), 10);
        assert_eq!(blocks.try_recv().unwrap(), 11);
        assert!(blocks.try_recv().is_err());
        assert_eq!(tracker.latest_block(), Some(11));
    }
}
