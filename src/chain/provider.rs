//! EVM JSON-RPC adapter with multi-RPC support and automatic failover

use super::{BlockInfo, ChainAdapter, SimulationResult};
use crate::config::ChainConfig;
use crate::error::{TxError, TxResult};
use crate::state::{TxParams, TxReceipt};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

const DEFAULT_TRANSFER_GAS: u64 = 21_000;

/// Multi-provider EVM adapter with automatic failover
pub struct EvmAdapter {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl EvmAdapter {
    /// Create a new EVM adapter
    pub fn new(config: ChainConfig) -> TxResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.selector, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(TxError::ChainConnection {
                chain: config.selector.clone(),
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.selector, next);
    }

    fn connection_error(&self, message: impl ToString) -> TxError {
        TxError::ChainConnection {
            chain: self.config.selector.clone(),
            message: message.to_string(),
        }
    }

    fn to_typed(params: &TxParams) -> TypedTransaction {
        let mut request = TransactionRequest::new()
            .from(params.from)
            .value(params.value)
            .data(params.data.clone());
        if let Some(to) = params.to {
            request = request.to(to);
        }
        if let Some(gas_price) = params.gas_price {
            request = request.gas_price(gas_price);
        }
        TypedTransaction::Legacy(request)
    }
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
    fn chain_id(&self) -> Option<u64> {
        self.config.chain_id
    }

    fn requires_expiration(&self) -> bool {
        false
    }

    fn transfer_gas_limit(&self) -> U256 {
        U256::from(self.config.transfer_gas_limit.unwrap_or(DEFAULT_TRANSFER_GAS))
    }

    /// Get the latest block with failover
    async fn latest_block(&self) -> TxResult<BlockInfo> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block(BlockNumber::Latest).await {
                Ok(Some(block)) => {
                    return Ok(BlockInfo {
                        number: block.number.map(|n| n.as_u64()).unwrap_or_default(),
                        gas_limit: block.gas_limit,
                        timestamp: block.timestamp.low_u64(),
                    });
                }
                Ok(None) => {
                    warn!("Chain {} returned no latest block", self.config.selector);
                    self.failover();
                }
                Err(e) => {
                    warn!(
                        "Failed to get latest block from chain {}: {}",
                        self.config.selector, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed"))
    }

    async fn simulate(&self, params: &TxParams) -> TxResult<SimulationResult> {
        let tx = Self::to_typed(params);

        let gas_used = self
            .http()
            .estimate_gas(&tx, None)
            .await
            .map_err(|e| TxError::Simulation(e.to_string()))?;

        // Post-balance of the native asset, when the sender's balance is readable
        let resource_deltas = match self.http().get_balance(params.from, None).await {
            Ok(balance) => {
                let fee = gas_used.saturating_mul(params.gas_price.unwrap_or_default());
                let post = balance.saturating_sub(params.value.saturating_add(fee));
                Some(BTreeMap::from([("native".to_string(), post)]))
            }
            Err(e) => {
                debug!("Balance lookup failed on {}: {}", self.config.selector, e);
                None
            }
        };

        Ok(SimulationResult {
            gas_used,
            resource_deltas,
        })
    }

    async fn gas_price(&self) -> TxResult<U256> {
        let price = self
            .http()
            .get_gas_price()
            .await
            .map_err(|e| TxError::GasEstimation(e.to_string()))?;

        // Cap at configured max
        Ok(match self.config.max_gas_price_gwei {
            Some(max_gwei) => {
                let max = U256::from(max_gwei) * U256::from(1_000_000_000u64);
                std::cmp::min(price, max)
            }
            None => price,
        })
    }

    async fn get_receipt(&self, hash: H256) -> TxResult<Option<TxReceipt>> {
        let receipt = self
            .http()
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| self.connection_error(e))?;

        // A receipt without a block number is still pending
        Ok(receipt.and_then(|r| {
            r.block_number.map(|block| TxReceipt {
                transaction_hash: r.transaction_hash,
                block_number: block.as_u64(),
                gas_used: r.gas_used,
                success: None,
            })
        }))
    }

    async fn broadcast(&self, raw: &Bytes) -> TxResult<H256> {
        let pending = self
            .http()
            .send_raw_transaction(raw.clone())
            .await
            .map_err(|e| TxError::Publish(e.to_string()))?;
        Ok(pending.tx_hash())
    }

    async fn account_sequence_number(&self, address: Address) -> TxResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self
                .http()
                .get_transaction_count(address, Some(BlockNumber::Latest.into()))
                .await
            {
                Ok(count) => return Ok(count.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get transaction count from chain {}: {}",
                        self.config.selector, e
                    );
                    self.failover();
                }
            }
        }

        Err(TxError::Nonce {
            chain: self.config.selector.clone(),
            address: format!("{:?}", address),
            message: "All providers failed".to_string(),
        })
    }

    async fn node_time(&self) -> TxResult<u64> {
        Ok(self.latest_block().await?.timestamp)
    }

    /// Health check
    async fn health_check(&self) -> bool {
        match self.latest_block().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.selector, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainProtocol;

    fn config(rpc_urls: Vec<&str>) -> ChainConfig {
        ChainConfig {
            selector: "eth:1".to_string(),
            name: "Ethereum".to_string(),
            protocol: ChainProtocol::Evm,
            rpc_urls: rpc_urls.into_iter().map(String::from).collect(),
            chain_id: Some(1),
            max_gas_price_gwei: Some(500),
            transfer_gas_limit: None,
            enabled: true,
        }
    }

    #[test]
    fn test_requires_a_valid_rpc_url() {
        assert!(EvmAdapter::new(config(vec!["not a url"])).is_err());

        let adapter = EvmAdapter::new(config(vec!["http://localhost:8545"])).unwrap();
        assert_eq!(adapter.chain_id(), Some(1));
        assert_eq!(adapter.transfer_gas_limit(), U256::from(21_000));
        assert!(!adapter.requires_expiration());
    }

    #[test]
    fn test_failover_cycles_providers() {
        let adapter = EvmAdapter::new(config(vec![
            "http://localhost:8545",
            "http://localhost:8546",
        ]))
        .unwrap();

        adapter.failover();
        assert_eq!(adapter.current_provider.load(Ordering::Relaxed), 1);
        adapter.failover();
        assert_eq!(adapter.current_provider.load(Ordering::Relaxed), 0);
    }
}
