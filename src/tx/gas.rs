//! Gas estimation via dry runs, with safety buffers bounded by the block gas limit

use crate::chain::ChainRegistry;
use crate::error::TxResult;
use crate::state::{ChainSelector, SimulationFailure, TransactionRecord};

use ethers::types::U256;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of analysing the gas needs of a transaction
#[derive(Debug, Clone, PartialEq)]
pub struct GasEstimate {
    pub gas_used: U256,
    pub block_gas_limit: U256,
    pub buffered_gas_limit: U256,
    pub resource_deltas: Option<BTreeMap<String, U256>>,
    pub simulation_failure: Option<SimulationFailure>,
}

/// Gas estimator for transactions
pub struct GasEstimator {
    chains: Arc<ChainRegistry>,
    /// Multiplier applied to simulated gas usage (e.g. 1.5)
    buffer_multiplier: f64,
    /// Expiry added to node time when none is requested
    default_expiry_secs: u64,
}

impl GasEstimator {
    /// Create a new gas estimator
    pub fn new(chains: Arc<ChainRegistry>, buffer_multiplier: f64, default_expiry_secs: u64) -> Self {
        Self {
            chains,
            buffer_multiplier,
            default_expiry_secs,
        }
    }

    /// Dry-run the transaction and derive a buffered gas limit.
    ///
    /// A failing dry run is not an error: the estimate falls back to 95% of the block
    /// gas limit and carries the failure as a diagnostic.
    pub async fn analyze_gas_usage(&self, record: &TransactionRecord) -> TxResult<GasEstimate> {
        let adapter = self.chains.get(&record.chain)?;
        let block = adapter.latest_block().await?;

        let (gas_used, resource_deltas, simulation_failure) =
            match adapter.simulate(&record.tx_params).await {
                Ok(result) => (result.gas_used, result.resource_deltas, None),
                Err(e) => {
                    warn!("Simulation failed for transaction {}: {}", record.id, e);
                    crate::metrics::record_simulation_failure(&record.chain);
                    let fallback = block.gas_limit * 95 / 100;
                    (
                        fallback,
                        None,
                        Some(SimulationFailure {
                            reason: e.to_string(),
                            debug: Some(format!(
                                "block {} gas limit {}",
                                block.number, block.gas_limit
                            )),
                        }),
                    )
                }
            };

        let buffered_gas_limit = add_gas_buffer(gas_used, block.gas_limit, self.buffer_multiplier);
        debug!(
            "Gas for transaction {}: used {}, buffered {}, block limit {}",
            record.id, gas_used, buffered_gas_limit, block.gas_limit
        );

        Ok(GasEstimate {
            gas_used,
            block_gas_limit: block.gas_limit,
            buffered_gas_limit,
            resource_deltas,
            simulation_failure,
        })
    }

    /// Node time plus `expiry_secs` (or the configured default)
    pub async fn get_expiration_timestamp_secs(
        &self,
        chain: &ChainSelector,
        expiry_secs: Option<u64>,
    ) -> TxResult<u64> {
        let adapter = self.chains.get(chain)?;
        let now = adapter.node_time().await?;
        Ok(now + expiry_secs.unwrap_or(self.default_expiry_secs))
    }

    /// Current network gas price for `chain`
    pub async fn suggest_gas_price(&self, chain: &ChainSelector) -> TxResult<U256> {
        let adapter = self.chains.get(chain)?;
        adapter.gas_price().await
    }
}

/// Buffer `used` by `multiplier`, never exceeding 90% of the block gas limit.
///
/// Usage already above that ceiling is returned unchanged.
pub fn add_gas_buffer(used: U256, block_gas_limit: U256, multiplier: f64) -> U256 {
    let upper = block_gas_limit * 9 / 10;
    if used > upper {
        return used;
    }

    let multiplier_bps = (multiplier * 10_000.0).round() as u64;
    let buffered = used.saturating_mul(U256::from(multiplier_bps)) / 10_000;
    std::cmp::min(buffered, upper)
}

/// Replacement gas price: the override when given, else `price` plus 10%
pub fn bump_gas_price(price: U256, gas_price_override: Option<U256>) -> U256 {
    gas_price_override.unwrap_or_else(|| price * 11 / 10)
}
