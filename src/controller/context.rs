//! Wallet-side context the controller consults: selected account, current chain
//! and per-origin permissions

use crate::config::Settings;
use crate::error::{TxError, TxResult};
use crate::state::ChainSelector;

use async_trait::async_trait;
use ethers::types::Address;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Origin used for requests raised by the wallet itself
pub const INTERNAL_ORIGIN: &str = "internal";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WalletContext: Send + Sync {
    /// Accounts `origin` has been granted access to
    async fn permitted_accounts(&self, origin: &str) -> Vec<Address>;

    async fn selected_address(&self) -> Option<Address>;

    async fn current_chain(&self) -> ChainSelector;
}

/// Wallet context backed by configuration, switchable at runtime
pub struct StaticWalletContext {
    selected: RwLock<Option<Address>>,
    chain: RwLock<ChainSelector>,
    permissions: HashMap<String, Vec<Address>>,
}

impl StaticWalletContext {
    pub fn new(
        selected: Option<Address>,
        chain: ChainSelector,
        permissions: HashMap<String, Vec<Address>>,
    ) -> Self {
        Self {
            selected: RwLock::new(selected),
            chain: RwLock::new(chain),
            permissions,
        }
    }

    /// Build from settings, skipping unparsable permission entries
    pub fn from_settings(settings: &Settings, selected: Option<Address>) -> Self {
        let mut permissions = HashMap::new();
        for (origin, accounts) in &settings.permissions {
            let parsed: Vec<Address> = accounts
                .iter()
                .filter_map(|a| match a.parse() {
                    Ok(address) => Some(address),
                    Err(e) => {
                        warn!("Ignoring permission {} for {}: {}", a, origin, e);
                        None
                    }
                })
                .collect();
            permissions.insert(origin.clone(), parsed);
        }

        Self::new(
            selected,
            ChainSelector::new(settings.engine.default_chain.clone()),
            permissions,
        )
    }

    pub async fn select_address(&self, address: Option<Address>) {
        *self.selected.write().await = address;
    }

    pub async fn set_current_chain(&self, chain: ChainSelector) {
        info!("Current chain is now {}", chain);
        *self.chain.write().await = chain;
    }
}

#[async_trait]
impl WalletContext for StaticWalletContext {
    async fn permitted_accounts(&self, origin: &str) -> Vec<Address> {
        self.permissions.get(origin).cloned().unwrap_or_default()
    }

    async fn selected_address(&self) -> Option<Address> {
        *self.selected.read().await
    }

    async fn current_chain(&self) -> ChainSelector {
        self.chain.read().await.clone()
    }
}

/// Check that `origin` may send from `from`.
///
/// The wallet itself may only send from the selected account; other origins need an
/// explicit permission.
pub async fn authorize(wallet: &dyn WalletContext, origin: &str, from: Address) -> TxResult<()> {
    let allowed = if origin == INTERNAL_ORIGIN {
        wallet.selected_address().await == Some(from)
    } else {
        wallet.permitted_accounts(origin).await.contains(&from)
    };

    if allowed {
        Ok(())
    } else {
        Err(TxError::Authorization {
            origin: origin.to_string(),
            address: format!("{:?}", from),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_authorize() {
        let selected = Address::repeat_byte(1);
        let other = Address::repeat_byte(2);
        let wallet = StaticWalletContext::new(
            Some(selected),
            ChainSelector::from("eth:1"),
            HashMap::from([("https://dapp.example".to_string(), vec![other])]),
        );

        assert!(authorize(&wallet, INTERNAL_ORIGIN, selected).await.is_ok());
        assert!(authorize(&wallet, INTERNAL_ORIGIN, other).await.is_err());
        assert!(authorize(&wallet, "https://dapp.example", other).await.is_ok());
        assert!(matches!(
            authorize(&wallet, "https://dapp.example", selected).await,
            Err(TxError::Authorization { .. })
        ));
        assert!(authorize(&wallet, "https://unknown.example", other).await.is_err());
    }

    #[tokio::test]
    async fn test_switching_chain_and_account() {
        let wallet = StaticWalletContext::new(None, ChainSelector::from("eth:1"), HashMap::new());
        wallet.select_address(Some(Address::repeat_byte(3))).await;
        wallet
            .set_current_chain(ChainSelector::from("ledger:mainnet"))
            .await;

        assert_eq!(wallet.selected_address().await, Some(Address::repeat_byte(3)));
        assert_eq!(wallet.current_chain().await.as_str(), "ledger:mainnet");
    }
}
