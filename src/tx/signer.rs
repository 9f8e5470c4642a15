//! Transaction signing capability
//!
//! Key management lives outside the engine; it only needs something that turns
//! parameters into signed bytes.

use crate::error::{TxError, TxResult};
use crate::state::{ChainSelector, MultiSigState, TxParams};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::keccak256;
use tracing::{debug, info};

/// Context passed to the signer
#[derive(Debug, Clone)]
pub struct SignOptions {
    pub chain: ChainSelector,
    pub chain_id: Option<u64>,
    /// Multi-sig state collected so far, for counter-signature rounds
    pub multisig: Option<MultiSigState>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignedTransaction {
    pub raw: Bytes,
    /// Hash the network will report for `raw`
    pub hash: H256,
    /// Set by multi-sig accounts; incomplete until enough owners signed
    pub multisig: Option<MultiSigState>,
}

/// What a co-signer needs to add their signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSignResources {
    pub address: Address,
    pub public_key: Option<Bytes>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    async fn sign(&self, params: &TxParams, from: Address, options: &SignOptions) -> TxResult<SignedTransaction>;

    async fn export_counter_sign_resources(&self, address: Address) -> TxResult<CounterSignResources>;
}

/// Signs legacy EVM transactions with in-memory keys
pub struct LocalWalletSigner {
    wallets: DashMap<Address, LocalWallet>,
}

impl LocalWalletSigner {
    pub fn new(wallets: Vec<LocalWallet>) -> Self {
        let signer = Self {
            wallets: DashMap::new(),
        };
        for wallet in wallets {
            signer.wallets.insert(wallet.address(), wallet);
        }
        signer
    }

    /// Load a single key from the environment variable `var`
    pub fn from_env(var: &str) -> TxResult<Self> {
        let key = std::env::var(var)
            .map_err(|_| TxError::Config(format!("Environment variable {} is not set", var)))?;
        let wallet = key
            .parse::<LocalWallet>()
            .map_err(|e| TxError::Config(format!("Invalid private key: {}", e)))?;

        info!("Loaded signing key for {:?}", wallet.address());
        Ok(Self::new(vec![wallet]))
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.wallets.iter().map(|w| *w.key()).collect()
    }

    fn wallet(&self, address: Address) -> TxResult<LocalWallet> {
        self.wallets
            .get(&address)
            .map(|w| w.clone())
            .ok_or_else(|| TxError::Signing(format!("No key for {:?}", address)))
    }
}

#[async_trait]
impl TransactionSigner for LocalWalletSigner {
    async fn sign(&self, params: &TxParams, from: Address, options: &SignOptions) -> TxResult<SignedTransaction> {
        let mut wallet = self.wallet(from)?;
        if let Some(chain_id) = options.chain_id {
            wallet = wallet.with_chain_id(chain_id);
        }

        let nonce = params
            .nonce
            .ok_or_else(|| TxError::Signing("Missing nonce".to_string()))?;
        let gas = params
            .gas_limit
            .ok_or_else(|| TxError::Signing("Missing gas limit".to_string()))?;
        let gas_price = params
            .gas_price
            .ok_or_else(|| TxError::Signing("Missing gas price".to_string()))?;

        let mut request = TransactionRequest::new()
            .from(from)
            .value(params.value)
            .data(params.data.clone())
            .nonce(nonce)
            .gas(gas)
            .gas_price(gas_price);
        if let Some(to) = params.to {
            request = request.to(to);
        }
        if let Some(chain_id) = options.chain_id {
            request = request.chain_id(chain_id);
        }

        let tx = TypedTransaction::Legacy(request);
        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| TxError::Signing(e.to_string()))?;

        let raw = tx.rlp_signed(&signature);
        let hash = H256::from(keccak256(&raw));
        debug!("Signed nonce {} for {:?} on {}: {:?}", nonce, from, options.chain, hash);

        Ok(SignedTransaction {
            raw,
            hash,
            multisig: None,
        })
    }

    async fn export_counter_sign_resources(&self, address: Address) -> TxResult<CounterSignResources> {
        let wallet = self.wallet(address)?;
        let point = wallet.signer().verifying_key().to_encoded_point(false);

        Ok(CounterSignResources {
            address,
            public_key: Some(Bytes::from(point.as_bytes().to_vec())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-known development key
    const DEV_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn signer() -> (LocalWalletSigner, Address) {
        let wallet = DEV_KEY.parse::<LocalWallet>().unwrap();
        let address = wallet.address();
        (LocalWalletSigner::new(vec![wallet]), address)
    }

    fn params(from: Address) -> TxParams {
        TxParams {
            from,
            to: Some(Address::repeat_byte(0xaa)),
            value: U256::from(1_000u64),
            nonce: Some(7),
            gas_limit: Some(U256::from(21_000u64)),
            gas_price: Some(U256::from(1_000_000_000u64)),
            ..Default::default()
        }
    }

    fn options() -> SignOptions {
        SignOptions {
            chain: ChainSelector::from("eth:1"),
            chain_id: Some(1),
            multisig: None,
        }
    }

    #[tokio::test]
    async fn test_sign_hash_matches_raw_bytes() {
        let (signer, from) = signer();
        let signed = signer.sign(&params(from), from, &options()).await.unwrap();

        assert!(!signed.raw.is_empty());
        assert_eq!(signed.hash, H256::from(keccak256(&signed.raw)));
        assert!(signed.multisig.is_none());
    }

    #[tokio::test]
    async fn test_sign_requires_nonce_and_known_key() {
        let (signer, from) = signer();

        let mut missing_nonce = params(from);
        missing_nonce.nonce = None;
        assert!(matches!(
            signer.sign(&missing_nonce, from, &options()).await,
            Err(TxError::Signing(_))
        ));

        let stranger = Address::repeat_byte(0x42);
        assert!(signer.sign(&params(stranger), stranger, &options()).await.is_err());
    }

    #[tokio::test]
    async fn test_export_counter_sign_resources() {
        let (signer, from) = signer();
        let resources = signer.export_counter_sign_resources(from).await.unwrap();
        assert_eq!(resources.address, from);
        // Uncompressed SEC1 point
        assert_eq!(resources.public_key.unwrap().len(), 65);
    }
}
