//! In-memory chain, signer and wallet used by unit tests

use crate::chain::{BlockInfo, ChainAdapter, SimulationResult};
use crate::controller::WalletContext;
use crate::error::{TxError, TxResult};
use crate::state::{ChainSelector, MultiSigState, TxParams, TxReceipt};
use crate::tx::{CounterSignResources, SignOptions, SignedTransaction, TransactionSigner};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub const BLOCK_GAS_LIMIT: u64 = 30_000_000;

#[derive(Default)]
struct FakeChainState {
    sequence_numbers: HashMap<Address, u64>,
    receipts: HashMap<H256, TxReceipt>,
    receipt_error: Option<String>,
    simulate_error: Option<String>,
    broadcast_error: Option<String>,
    gas_used: u64,
    gas_price: u64,
    node_time: u64,
    block_number: u64,
    requires_expiration: bool,
}

/// Scriptable ledger
pub struct FakeChain {
    state: Mutex<FakeChainState>,
    broadcasts: Mutex<Vec<Bytes>>,
    sequence_queries: AtomicUsize,
}

impl FakeChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeChainState {
                gas_used: 21_000,
                gas_price: 1_000_000_000,
                node_time: 1_700_000_000,
                block_number: 100,
                ..Default::default()
            }),
            broadcasts: Mutex::new(Vec::new()),
            sequence_queries: AtomicUsize::new(0),
        }
    }

    pub fn with_expiration() -> Self {
        let chain = Self::new();
        chain.state.lock().unwrap().requires_expiration = true;
        chain
    }

    pub fn set_sequence_number(&self, address: Address, nonce: u64) {
        self.state.lock().unwrap().sequence_numbers.insert(address, nonce);
    }

    pub fn set_receipt(&self, hash: H256, block_number: u64, success: Option<bool>) {
        self.state.lock().unwrap().receipts.insert(
            hash,
            TxReceipt {
                transaction_hash: hash,
                block_number,
                gas_used: Some(U256::from(21_000u64)),
                success,
            },
        );
    }

    pub fn fail_receipts(&self, message: &str) {
        self.state.lock().unwrap().receipt_error = Some(message.to_string());
    }

    pub fn fail_simulation(&self, message: &str) {
        self.state.lock().unwrap().simulate_error = Some(message.to_string());
    }

    pub fn fail_broadcast(&self, message: &str) {
        self.state.lock().unwrap().broadcast_error = Some(message.to_string());
    }

    pub fn set_gas_price(&self, gas_price: u64) {
        self.state.lock().unwrap().gas_price = gas_price;
    }

    pub fn set_node_time(&self, node_time: u64) {
        self.state.lock().unwrap().node_time = node_time;
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.lock().unwrap().len()
    }

    pub fn sequence_queries(&self) -> usize {
        self.sequence_queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainAdapter for FakeChain {
    fn chain_id(&self) -> Option<u64> {
        Some(1)
    }

    fn requires_expiration(&self) -> bool {
        self.state.lock().unwrap().requires_expiration
    }

    fn transfer_gas_limit(&self) -> U256 {
        U256::from(21_000u64)
    }

    async fn latest_block(&self) -> TxResult<BlockInfo> {
        let state = self.state.lock().unwrap();
        Ok(BlockInfo {
            number: state.block_number,
            gas_limit: U256::from(BLOCK_GAS_LIMIT),
            timestamp: state.node_time,
        })
    }

    async fn simulate(&self, _params: &TxParams) -> TxResult<SimulationResult> {
        let state = self.state.lock().unwrap();
        match &state.simulate_error {
            Some(message) => Err(TxError::Simulation(message.clone())),
            None => Ok(SimulationResult {
                gas_used: U256::from(state.gas_used),
                resource_deltas: None,
            }),
        }
    }

    async fn gas_price(&self) -> TxResult<U256> {
        Ok(U256::from(self.state.lock().unwrap().gas_price))
    }

    async fn get_receipt(&self, hash: H256) -> TxResult<Option<TxReceipt>> {
        let state = self.state.lock().unwrap();
        if let Some(message) = &state.receipt_error {
            return Err(TxError::ChainConnection {
                chain: "fake".to_string(),
                message: message.clone(),
            });
        }
        Ok(state.receipts.get(&hash).cloned())
    }

    async fn broadcast(&self, raw: &Bytes) -> TxResult<H256> {
        tokio::task::yield_now().await;
        if let Some(message) = self.state.lock().unwrap().broadcast_error.clone() {
            return Err(TxError::Publish(message));
        }
        self.broadcasts.lock().unwrap().push(raw.clone());
        Ok(H256::from(keccak256(raw)))
    }

    async fn account_sequence_number(&self, address: Address) -> TxResult<u64> {
        self.sequence_queries.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(self
            .state
            .lock()
            .unwrap()
            .sequence_numbers
            .get(&address)
            .copied()
            .unwrap_or(0))
    }

    async fn node_time(&self) -> TxResult<u64> {
        Ok(self.state.lock().unwrap().node_time)
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Signer producing deterministic bytes, optionally behaving like a multi-sig account
pub struct FakeSigner {
    fail_with: Mutex<Option<String>>,
    multisig: Mutex<Option<(u32, Vec<Address>)>>,
    signed: AtomicUsize,
}

impl FakeSigner {
    pub fn new() -> Self {
        Self {
            fail_with: Mutex::new(None),
            multisig: Mutex::new(None),
            signed: AtomicUsize::new(0),
        }
    }

    pub fn fail_with(&self, message: &str) {
        *self.fail_with.lock().unwrap() = Some(message.to_string());
    }

    pub fn multisig(&self, threshold: u32, owners: Vec<Address>) {
        *self.multisig.lock().unwrap() = Some((threshold, owners));
    }

    pub fn signed_count(&self) -> usize {
        self.signed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionSigner for FakeSigner {
    async fn sign(&self, params: &TxParams, _from: Address, options: &SignOptions) -> TxResult<SignedTransaction> {
        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            return Err(TxError::Signing(message));
        }
        self.signed.fetch_add(1, Ordering::SeqCst);

        let raw = Bytes::from(serde_json::to_vec(params).unwrap());
        let hash = H256::from(keccak256(&raw));

        let multisig = self
            .multisig
            .lock()
            .unwrap()
            .clone()
            .map(|(threshold, owners)| MultiSigState {
                threshold,
                signatures: options.multisig.as_ref().map_or(0, |m| m.signatures) + 1,
                partial_payload: Some(raw.clone()),
                owners,
                expiration_timestamp_secs: params.expiration_timestamp_secs,
            });

        Ok(SignedTransaction {
            raw,
            hash,
            multisig,
        })
    }

    async fn export_counter_sign_resources(&self, address: Address) -> TxResult<CounterSignResources> {
        Ok(CounterSignResources {
            address,
            public_key: None,
        })
    }
}

/// Wallet with a fixed selected account
pub struct FakeWallet {
    pub selected: Mutex<Option<Address>>,
    pub chain: Mutex<ChainSelector>,
    pub permissions: HashMap<String, Vec<Address>>,
}

impl FakeWallet {
    pub fn new(selected: Address) -> Self {
        Self {
            selected: Mutex::new(Some(selected)),
            chain: Mutex::new(ChainSelector::from("eth:1")),
            permissions: HashMap::new(),
        }
    }

    pub fn with_permission(mut self, origin: &str, accounts: Vec<Address>) -> Self {
        self.permissions.insert(origin.to_string(), accounts);
        self
    }
}

#[async_trait]
impl WalletContext for FakeWallet {
    async fn permitted_accounts(&self, origin: &str) -> Vec<Address> {
        self.permissions.get(origin).cloned().unwrap_or_default()
    }

    async fn selected_address(&self) -> Option<Address> {
        *self.selected.lock().unwrap()
    }

    async fn current_chain(&self) -> ChainSelector {
        self.chain.lock().unwrap().clone()
    }
}
