//! Chain module - per-ledger adapters and new-block tracking
//!
//! This module provides:
//! - The [`ChainAdapter`] seam every ledger implements (dry run, receipts, broadcast,
//!   sequence numbers, node time)
//! - An EVM JSON-RPC adapter with multi-RPC failover
//! - A sequence-number ledger adapter speaking the gateway's JSON-RPC dialect
//! - A polling block tracker that paces the pending-transaction scan

pub mod ledger;
pub mod listener;
pub mod provider;

pub use ledger::LedgerAdapter;
pub use listener::{BlockTracker, PollingBlockTracker};
pub use provider::EvmAdapter;

use crate::config::{ChainProtocol, Settings};
use crate::error::{TxError, TxResult};
use crate::state::{ChainSelector, TxParams, TxReceipt};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::{Address, Bytes, H256, U256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Latest block metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub number: u64,
    pub gas_limit: U256,
    pub timestamp: u64,
}

/// Result of a successful dry run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationResult {
    pub gas_used: U256,
    /// Simulated post-balance per asset identifier
    pub resource_deltas: Option<BTreeMap<String, U256>>,
}

/// Everything the engine needs from a ledger
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// Numeric chain id used for replay protection when signing, if any
    fn chain_id(&self) -> Option<u64>;

    /// Whether transactions on this ledger carry an expiration timestamp
    fn requires_expiration(&self) -> bool;

    /// Gas limit of a plain value transfer, used for cancel transactions
    fn transfer_gas_limit(&self) -> U256;

    async fn latest_block(&self) -> TxResult<BlockInfo>;

    /// Dry-run a candidate transaction against current chain state
    async fn simulate(&self, params: &TxParams) -> TxResult<SimulationResult>;

    async fn gas_price(&self) -> TxResult<U256>;

    async fn get_receipt(&self, hash: H256) -> TxResult<Option<TxReceipt>>;

    async fn broadcast(&self, raw: &Bytes) -> TxResult<H256>;

    /// The network's next nonce for `address`
    async fn account_sequence_number(&self, address: Address) -> TxResult<u64>;

    /// Current time according to the node, in seconds
    async fn node_time(&self) -> TxResult<u64>;

    async fn health_check(&self) -> bool;
}

/// Adapters for every configured ledger, keyed by chain selector
pub struct ChainRegistry {
    adapters: DashMap<ChainSelector, Arc<dyn ChainAdapter>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self {
            adapters: DashMap::new(),
        }
    }

    /// Create adapters for all enabled chains
    pub fn from_settings(settings: &Settings) -> TxResult<Self> {
        let registry = Self::new();

        for (name, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} ({}, {:?})",
                name, chain_config.selector, chain_config.protocol
            );

            let adapter: Arc<dyn ChainAdapter> = match chain_config.protocol {
                ChainProtocol::Evm => Arc::new(EvmAdapter::new(chain_config.clone())?),
                ChainProtocol::Ledger => Arc::new(LedgerAdapter::new(chain_config.clone())?),
            };
            registry.register(ChainSelector::new(chain_config.selector.clone()), adapter);
        }

        Ok(registry)
    }

    pub fn register(&self, selector: ChainSelector, adapter: Arc<dyn ChainAdapter>) {
        self.adapters.insert(selector, adapter);
    }

    /// Get the adapter for a chain selector
    pub fn get(&self, selector: &ChainSelector) -> TxResult<Arc<dyn ChainAdapter>> {
        self.adapters
            .get(selector)
            .map(|a| a.clone())
            .ok_or_else(|| TxError::ChainNotFound {
                chain: selector.to_string(),
            })
    }

    /// Get all registered chain selectors
    pub fn connected_chains(&self) -> Vec<ChainSelector> {
        self.adapters.iter().map(|e| e.key().clone()).collect()
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(ChainSelector, bool)> {
        let adapters: Vec<_> = self
            .adapters
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut results = Vec::with_capacity(adapters.len());
        for (selector, adapter) in adapters {
            let healthy = adapter.health_check().await;
            if !healthy {
                warn!("Chain {} health check failed", selector);
            }
            crate::metrics::record_chain_health(&selector, healthy);
            results.push((selector, healthy));
        }

        results
    }
}

impl Default for ChainRegistry {
    fn default() -> Self {
        Self::new()
    }
}
