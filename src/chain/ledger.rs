//! Sequence-number ledger adapter
//!
//! Talks to a JSON-RPC gateway exposing the `ledger_*` method family. The ledger
//! reports execution status separately from inclusion and rejects transactions
//! without an expiration timestamp.

use super::{BlockInfo, ChainAdapter, SimulationResult};
use crate::config::ChainConfig;
use crate::error::{TxError, TxResult};
use crate::state::{TxParams, TxReceipt};

use async_trait::async_trait;
use ethers::providers::{Http, Provider, ProviderError};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, error};

const DEFAULT_TRANSFER_GAS_UNITS: u64 = 2_000;

#[derive(Debug, Serialize, Deserialize)]
struct LedgerInfo {
    block_height: u64,
    ledger_timestamp_secs: u64,
    block_gas_limit: U256,
}

#[derive(Debug, Serialize, Deserialize)]
struct BalanceChange {
    asset: String,
    balance: U256,
}

#[derive(Debug, Serialize, Deserialize)]
struct SimulatedTransaction {
    success: bool,
    vm_status: String,
    gas_used: U256,
    #[serde(default)]
    changes: Vec<BalanceChange>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AccountInfo {
    sequence_number: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CommittedTransaction {
    hash: H256,
    success: bool,
    vm_status: String,
    block_height: u64,
    gas_used: U256,
}

#[derive(Debug, Serialize)]
struct SimulationRequest<'a> {
    sender: Address,
    to: Option<Address>,
    value: U256,
    payload: &'a Bytes,
    sequence_number: Option<u64>,
    max_gas_amount: Option<U256>,
    gas_unit_price: Option<U256>,
    expiration_timestamp_secs: Option<u64>,
}

impl<'a> From<&'a TxParams> for SimulationRequest<'a> {
    fn from(params: &'a TxParams) -> Self {
        Self {
            sender: params.from,
            to: params.to,
            value: params.value,
            payload: &params.data,
            sequence_number: params.nonce,
            max_gas_amount: params.gas_limit,
            gas_unit_price: params.gas_price,
            expiration_timestamp_secs: params.expiration_timestamp_secs,
        }
    }
}

/// Adapter for the sequence-number ledger gateway
pub struct LedgerAdapter {
    config: ChainConfig,
    client: Provider<Http>,
}

impl LedgerAdapter {
    pub fn new(config: ChainConfig) -> TxResult<Self> {
        let url = config
            .rpc_urls
            .first()
            .ok_or_else(|| TxError::ChainConnection {
                chain: config.selector.clone(),
                message: "No RPC URL configured".to_string(),
            })?;

        let client = Provider::<Http>::try_from(url.as_str()).map_err(|e| {
            TxError::ChainConnection {
                chain: config.selector.clone(),
                message: e.to_string(),
            }
        })?;

        debug!("Ledger gateway for {}: {}", config.selector, url);
        Ok(Self { config, client })
    }

    fn connection_error(&self, e: ProviderError) -> TxError {
        TxError::ChainConnection {
            chain: self.config.selector.clone(),
            message: e.to_string(),
        }
    }

    async fn ledger_info(&self) -> TxResult<LedgerInfo> {
        self.client
            .request("ledger_getLedgerInfo", ())
            .await
            .map_err(|e| self.connection_error(e))
    }
}

#[async_trait]
impl ChainAdapter for LedgerAdapter {
    fn chain_id(&self) -> Option<u64> {
        self.config.chain_id
    }

    fn requires_expiration(&self) -> bool {
        true
    }

    fn transfer_gas_limit(&self) -> U256 {
        U256::from(
            self.config
                .transfer_gas_limit
                .unwrap_or(DEFAULT_TRANSFER_GAS_UNITS),
        )
    }

    async fn latest_block(&self) -> TxResult<BlockInfo> {
        let info = self.ledger_info().await?;
        Ok(BlockInfo {
            number: info.block_height,
            gas_limit: info.block_gas_limit,
            timestamp: info.ledger_timestamp_secs,
        })
    }

    async fn simulate(&self, params: &TxParams) -> TxResult<SimulationResult> {
        let request = SimulationRequest::from(params);
        let simulated: SimulatedTransaction = self
            .client
            .request("ledger_simulateTransaction", [request])
            .await
            .map_err(|e| TxError::Simulation(e.to_string()))?;

        if !simulated.success {
            return Err(TxError::Simulation(simulated.vm_status));
        }

        let resource_deltas = if simulated.changes.is_empty() {
            None
        } else {
            Some(
                simulated
                    .changes
                    .into_iter()
                    .map(|c| (c.asset, c.balance))
                    .collect::<BTreeMap<_, _>>(),
            )
        };

        Ok(SimulationResult {
            gas_used: simulated.gas_used,
            resource_deltas,
        })
    }

    async fn gas_price(&self) -> TxResult<U256> {
        self.client
            .request("ledger_estimateGasPrice", ())
            .await
            .map_err(|e| TxError::GasEstimation(e.to_string()))
    }

    async fn get_receipt(&self, hash: H256) -> TxResult<Option<TxReceipt>> {
        let committed: Option<CommittedTransaction> = self
            .client
            .request("ledger_getTransactionByHash", [hash])
            .await
            .map_err(|e| self.connection_error(e))?;

        Ok(committed.map(|tx| {
            if !tx.success {
                debug!("Ledger transaction {:?} aborted: {}", tx.hash, tx.vm_status);
            }
            TxReceipt {
                transaction_hash: tx.hash,
                block_number: tx.block_height,
                gas_used: Some(tx.gas_used),
                success: Some(tx.success),
            }
        }))
    }

    async fn broadcast(&self, raw: &Bytes) -> TxResult<H256> {
        self.client
            .request("ledger_submitTransaction", [raw])
            .await
            .map_err(|e| TxError::Publish(e.to_string()))
    }

    async fn account_sequence_number(&self, address: Address) -> TxResult<u64> {
        let account: AccountInfo = self
            .client
            .request("ledger_getAccount", [address])
            .await
            .map_err(|e| TxError::Nonce {
                chain: self.config.selector.clone(),
                address: format!("{:?}", address),
                message: e.to_string(),
            })?;
        Ok(account.sequence_number)
    }

    async fn node_time(&self) -> TxResult<u64> {
        Ok(self.ledger_info().await?.ledger_timestamp_secs)
    }

    async fn health_check(&self) -> bool {
        match self.ledger_info().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for ledger {}: {}", self.config.selector, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainProtocol;

    #[test]
    fn test_simulation_request_carries_expiration() {
        let params = TxParams {
            from: Address::repeat_byte(1),
            nonce: Some(3),
            expiration_timestamp_secs: Some(1_700_000_000),
            ..Default::default()
        };
        let json = serde_json::to_value(SimulationRequest::from(&params)).unwrap();
        assert_eq!(json["sequence_number"], 3);
        assert_eq!(json["expiration_timestamp_secs"], 1_700_000_000u64);
    }

    #[test]
    fn test_committed_transaction_decoding() {
        let json = serde_json::json!({
            "hash": format!("{:?}", H256::repeat_byte(7)),
            "success": false,
            "vm_status": "Move abort: EINSUFFICIENT_BALANCE",
            "block_height": 42,
            "gas_used": "0x10"
        });
        let tx: CommittedTransaction = serde_json::from_value(json).unwrap();
        assert!(!tx.success);
        assert_eq!(tx.gas_used, U256::from(16));
    }

    #[test]
    fn test_requires_expiration() {
        let adapter = LedgerAdapter::new(ChainConfig {
            selector: "ledger:mainnet".to_string(),
            name: "Ledger".to_string(),
            protocol: ChainProtocol::Ledger,
            rpc_urls: vec!["http://localhost:8080/v1".to_string()],
            chain_id: Some(1),
            max_gas_price_gwei: None,
            transfer_gas_limit: None,
            enabled: true,
        })
        .unwrap();
        assert!(adapter.requires_expiration());
        assert_eq!(adapter.transfer_gas_limit(), U256::from(2_000));
    }
}
