//! Transaction controller
//!
//! Public entry point of the engine. It validates and records new requests,
//! drives approved transactions through nonce allocation, signing and
//! publication, creates cancel and speed-up replacements, and applies the
//! pending tracker's findings on every new block.

pub mod context;
pub mod validation;


pub use context::{authorize, StaticWalletContext, WalletContext, INTERNAL_ORIGIN};
pub use validation::{determine_tx_type, normalize_tx_params, TxRequest};

use crate::chain::{BlockTracker, ChainRegistry};
use crate::config::EngineConfig;
use crate::error::{TxError, TxResult};
use crate::events::{TxEvent, TxOutcome};
use crate::state::{
    ChainSelector, TransactionRecord, TransactionStore, TxFilter, TxParams, TxReceipt, TxStatus,
    TxType, TxWarning,
};
use crate::tracker::{PendingTransactionTracker, TrackerEvent};
use crate::tx::{
    bump_gas_price, CounterSignResources, GasEstimator, NonceTracker, SignOptions,
    TransactionSigner,
};

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashSet;
use ethers::types::{Address, Bytes, H256, U256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How often the run loop checks whether blocks stopped arriving
const OFFLINE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Clears the in-progress marker of a record when approval finishes
struct ApprovalGuard<'a> {
    in_progress: &'a DashSet<u64>,
    id: u64,
}

impl Drop for ApprovalGuard<'_> {
    fn drop(&mut self) {
        self.in_progress.remove(&self.id);
    }
}

/// Orchestrates the transaction lifecycle
pub struct TransactionController {
    config: EngineConfig,
    store: Arc<TransactionStore>,
    chains: Arc<ChainRegistry>,
    nonce_tracker: NonceTracker,
    gas: GasEstimator,
    tracker: PendingTransactionTracker,
    signer: Arc<dyn TransactionSigner>,
    wallet: Arc<dyn WalletContext>,
    /// Records currently being approved
    in_progress: DashSet<u64>,
    shutdown: watch::Sender<bool>,
}

impl TransactionController {
    pub fn new(
        config: EngineConfig,
        store: Arc<TransactionStore>,
        chains: Arc<ChainRegistry>,
        signer: Arc<dyn TransactionSigner>,
        wallet: Arc<dyn WalletContext>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);

        Self {
            nonce_tracker: NonceTracker::new(store.clone(), chains.clone()),
            gas: GasEstimator::new(
                chains.clone(),
                config.gas_buffer_multiplier,
                config.default_expiry_secs,
            ),
            tracker: PendingTransactionTracker::new(
                store.clone(),
                chains.clone(),
                config.dropped_buffer_count,
            ),
            config,
            store,
            chains,
            signer,
            wallet,
            in_progress: DashSet::new(),
            shutdown,
        }
    }

    pub fn store(&self) -> &Arc<TransactionStore> {
        &self.store
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<TxEvent> {
        self.store.subscribe()
    }

    pub fn nonce_tracker(&self) -> &NonceTracker {
        &self.nonce_tracker
    }

    async fn get_record(&self, id: u64) -> TxResult<TransactionRecord> {
        self.store
            .get_tx(id)
            .await
            .ok_or(TxError::TransactionNotFound { id })
    }

    /// Validate, authorize and record a new request, then fill in gas defaults.
    ///
    /// If the defaults cannot be computed the record is marked failed and the error
    /// returned.
    pub async fn add_unapproved_transaction(
        &self,
        request: TxRequest,
        origin: &str,
    ) -> TxResult<TransactionRecord> {
        let params = normalize_tx_params(&request)?;
        authorize(self.wallet.as_ref(), origin, params.from).await?;

        let chain = match request.chain.as_deref() {
            Some(chain) => ChainSelector::from(chain),
            None => self.wallet.current_chain().await,
        };
        self.chains.get(&chain)?;

        let tx_type = determine_tx_type(&params, request.swap);
        let custom_nonce = params.nonce;
        let mut record = TransactionRecord::new(
            chain,
            tx_type,
            TxParams {
                nonce: None,
                ..params
            },
            origin,
        );
        record.custom_nonce = custom_nonce;

        let record = self.store.add_tx(record).await?;
        info!(
            "Added {} transaction {} from {:?} on {} ({})",
            record.tx_type.as_str(),
            record.id,
            record.from(),
            record.chain,
            origin
        );
        crate::metrics::record_tx_added(&record.chain, record.tx_type);

        let record = match self.add_tx_gas_defaults(record.clone()).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to add gas defaults to transaction {}: {}", record.id, e);
                self.fail_transaction(record.id, &e).await;
                return Err(e);
            }
        };

        self.store.emit(TxEvent::NewUnapproved { id: record.id });
        Ok(record)
    }

    async fn add_tx_gas_defaults(&self, mut record: TransactionRecord) -> TxResult<TransactionRecord> {
        let adapter = self.chains.get(&record.chain)?;

        if record.tx_params.gas_price.is_none() {
            record.tx_params.gas_price = Some(self.gas.suggest_gas_price(&record.chain).await?);
        }

        if adapter.requires_expiration() && record.tx_params.expiration_timestamp_secs.is_none() {
            record.tx_params.expiration_timestamp_secs = Some(
                self.gas
                    .get_expiration_timestamp_secs(&record.chain, None)
                    .await?,
            );
        }

        if record.tx_params.gas_limit.is_none() {
            let estimate = self.gas.analyze_gas_usage(&record).await?;
            record.tx_params.gas_limit = Some(estimate.buffered_gas_limit);
            record.simulation_failure = estimate.simulation_failure;
            record.resource_deltas = estimate.resource_deltas;
        }

        self.store.update_tx(&record, "added gas defaults").await?;
        self.get_record(record.id).await
    }

    /// Add a request and wait until it is submitted, rejected or failed
    pub async fn new_unapproved_transaction(&self, request: TxRequest, origin: &str) -> TxResult<H256> {
        let record = self.add_unapproved_transaction(request, origin).await?;
        let outcome = self.store.wait_for_outcome(record.id).await?;

        match outcome.await {
            Ok(TxOutcome::Submitted(hash)) => Ok(hash),
            Ok(TxOutcome::Rejected) => Err(TxError::UserRejected { id: record.id }),
            Ok(TxOutcome::Failed(message)) => Err(TxError::Transaction(message)),
            Err(_) => Err(TxError::Internal(format!(
                "completion signal for transaction {} was dropped",
                record.id
            ))),
        }
    }

    /// Approve, sign and publish a transaction.
    ///
    /// Concurrent approvals of the same id collapse into one; approving a record that
    /// already moved past approval is a no-op.
    pub async fn approve_transaction(&self, id: u64) -> TxResult<()> {
        if !self.in_progress.insert(id) {
            debug!("Approval of transaction {} already in progress", id);
            return Ok(());
        }
        let _guard = ApprovalGuard {
            in_progress: &self.in_progress,
            id,
        };

        let record = self.get_record(id).await?;
        match record.status {
            TxStatus::Unapproved | TxStatus::Approved => {}
            TxStatus::Failed | TxStatus::Rejected => {
                return Err(TxError::InvalidStateTransition {
                    id,
                    from: record.status.to_string(),
                    to: TxStatus::Approved.to_string(),
                });
            }
            _ => {
                debug!("Transaction {} already approved ({})", id, record.status);
                return Ok(());
            }
        }

        if record.is_counter_signature() {
            self.validate_counter_signature(&record).await?;
        }

        let record = if record.status == TxStatus::Unapproved {
            self.store.set_tx_status_approved(id).await?
        } else {
            record
        };

        if let Err(e) = self.sign_and_publish(record).await {
            warn!("Approval of transaction {} failed: {}", id, e);
            self.fail_transaction(id, &e).await;
            return Err(e);
        }

        Ok(())
    }

    async fn sign_and_publish(&self, mut record: TransactionRecord) -> TxResult<()> {
        let adapter = self.chains.get(&record.chain)?;

        let preassigned = record.is_counter_signature()
            || (record.tx_type.is_replacement() && record.nonce().is_some());
        let nonce_lock = if preassigned {
            None
        } else {
            let lock = self
                .nonce_tracker
                .get_nonce_lock(record.from(), &record.chain)
                .await?;
            record.tx_params.nonce = Some(record.custom_nonce.unwrap_or(lock.next_nonce));
            record.nonce_details = Some(lock.nonce_details.clone());
            self.store.update_tx(&record, "nonce assigned").await?;
            Some(lock)
        };

        let options = SignOptions {
            chain: record.chain.clone(),
            chain_id: adapter.chain_id(),
            multisig: record.multisig.clone(),
        };
        let signed = self
            .signer
            .sign(&record.tx_params, record.from(), &options)
            .await?;

        if let Some(multisig) = signed.multisig.clone() {
            if !multisig.is_complete() {
                info!(
                    "Transaction {} has {}/{} signatures, awaiting co-signers",
                    record.id, multisig.signatures, multisig.threshold
                );
                self.store
                    .set_tx_status_multisign_pending(record.id, multisig)
                    .await?;
                if let Some(lock) = nonce_lock {
                    lock.release();
                }
                return Ok(());
            }
            record.multisig = Some(multisig);
        }

        record.raw_signed = Some(signed.raw.clone());
        self.store.update_tx(&record, "signed").await?;

        let hash = match adapter.broadcast(&signed.raw).await {
            Ok(hash) => hash,
            Err(e) if e.is_already_known() => {
                debug!("Transaction {} already known to the node", record.id);
                signed.hash
            }
            Err(e) => return Err(e),
        };

        self.store.set_tx_status_submitted(record.id, hash).await?;
        crate::metrics::record_tx_submitted(&record.chain);
        info!(
            "Submitted transaction {} with nonce {:?}: {:?}",
            record.id,
            record.nonce(),
            hash
        );

        if let Some(lock) = nonce_lock {
            lock.release();
        }
        Ok(())
    }

    async fn validate_counter_signature(&self, record: &TransactionRecord) -> TxResult<()> {
        let multisig = record.multisig.as_ref().ok_or_else(|| {
            TxError::Validation(format!("transaction {} has no multi-sig state", record.id))
        })?;

        let expiration = multisig
            .expiration_timestamp_secs
            .or(record.tx_params.expiration_timestamp_secs);
        if let Some(expired_at) = expiration {
            let now = self.chains.get(&record.chain)?.node_time().await?;
            if expired_at <= now {
                return Err(TxError::ExpiredMultiSig { expired_at, now });
            }
        }

        let signer = self.wallet.selected_address().await;
        if !signer.map_or(false, |s| multisig.owners.contains(&s)) {
            return Err(TxError::WrongSigner {
                signer: signer
                    .map(|s| format!("{:?}", s))
                    .unwrap_or_else(|| "none".to_string()),
            });
        }

        let current = self.wallet.current_chain().await;
        if current != record.chain {
            return Err(TxError::WrongChain {
                expected: record.chain.to_string(),
                actual: current.to_string(),
            });
        }

        Ok(())
    }

    /// Record co-signatures collected for a multi-sig transaction and run another
    /// signing round
    pub async fn add_co_signatures(
        &self,
        id: u64,
        payload: Bytes,
        signatures: u32,
    ) -> TxResult<TransactionRecord> {
        let record = self.get_record(id).await?;
        if record.status != TxStatus::MultiSignPending {
            return Err(TxError::InvalidStateTransition {
                id,
                from: record.status.to_string(),
                to: TxStatus::Approved.to_string(),
            });
        }

        let mut multisig = record.multisig.clone().ok_or_else(|| {
            TxError::Validation(format!("transaction {} has no multi-sig state", id))
        })?;
        multisig.signatures = std::cmp::max(multisig.signatures, signatures);
        multisig.partial_payload = Some(payload);
        self.validate_counter_signature(&record).await?;

        self.store.set_tx_status_reapproved(id, multisig).await?;
        self.approve_transaction(id).await?;
        self.get_record(id).await
    }

    /// What a co-signer needs, for the selected account
    pub async fn export_counter_sign_resources(&self) -> TxResult<CounterSignResources> {
        let address = self
            .wallet
            .selected_address()
            .await
            .ok_or_else(|| TxError::Validation("no account selected".to_string()))?;
        self.signer.export_counter_sign_resources(address).await
    }

    /// Apply user edits to an unapproved record and approve it
    ///
    /// Only the payload, gas fields and a custom nonce are taken from `edited`.
    /// Sender, chain, origin and type stay as they were added.
    pub async fn update_and_approve_transaction(&self, edited: TransactionRecord) -> TxResult<()> {
        let mut record = self.get_record(edited.id).await?;
        if record.status != TxStatus::Unapproved {
            return Err(TxError::InvalidStateTransition {
                id: record.id,
                from: record.status.to_string(),
                to: TxStatus::Approved.to_string(),
            });
        }
        if edited.from() != record.from()
            || edited.chain != record.chain
            || edited.origin != record.origin
            || edited.tx_type != record.tx_type
        {
            return Err(TxError::Validation(format!(
                "transaction {} can only be edited in its payload, gas and nonce",
                record.id
            )));
        }

        let custom_nonce = edited.tx_params.nonce.or(edited.custom_nonce);
        if record.tx_type.is_replacement() && custom_nonce != record.nonce() {
            return Err(TxError::Validation(format!(
                "transaction {} replaces another and keeps its nonce",
                record.id
            )));
        }

        let params = &mut record.tx_params;
        params.to = edited.tx_params.to;
        params.value = edited.tx_params.value;
        params.data = edited.tx_params.data;
        params.gas_limit = edited.tx_params.gas_limit;
        params.gas_price = edited.tx_params.gas_price;
        if !record.tx_type.is_replacement() {
            record.custom_nonce = custom_nonce;
        }

        self.store.update_tx(&record, "user edited transaction").await?;
        self.approve_transaction(record.id).await
    }

    /// Reject an unapproved (or partially signed) transaction
    pub async fn cancel_transaction(&self, id: u64) -> TxResult<()> {
        let record = self.store.set_tx_status_rejected(id).await?;
        info!("Transaction {} rejected", record.id);
        Ok(())
    }

    /// Replace a submitted transaction with a zero-value self transfer using the same nonce
    pub async fn create_cancel_transaction(
        &self,
        original_id: u64,
        gas_price_override: Option<U256>,
    ) -> TxResult<TransactionRecord> {
        let original = self.replaceable(original_id).await?;
        let adapter = self.chains.get(&original.chain)?;
        let last_gas_price = self.last_gas_price(&original).await?;

        let params = TxParams {
            from: original.from(),
            to: Some(original.from()),
            value: U256::zero(),
            data: Bytes::default(),
            nonce: original.nonce(),
            gas_limit: Some(adapter.transfer_gas_limit()),
            gas_price: Some(bump_gas_price(last_gas_price, gas_price_override)),
            multisig_payload: None,
            expiration_timestamp_secs: original.tx_params.expiration_timestamp_secs,
        };

        self.add_replacement(&original, TxType::Cancel, params, last_gas_price)
            .await
    }

    /// Resend a submitted transaction with a higher gas price
    pub async fn create_speed_up_transaction(
        &self,
        original_id: u64,
        gas_price_override: Option<U256>,
    ) -> TxResult<TransactionRecord> {
        let original = self.replaceable(original_id).await?;
        let last_gas_price = self.last_gas_price(&original).await?;

        let params = TxParams {
            gas_price: Some(bump_gas_price(last_gas_price, gas_price_override)),
            multisig_payload: None,
            ..original.tx_params.clone()
        };

        self.add_replacement(&original, TxType::Retry, params, last_gas_price)
            .await
    }

    async fn replaceable(&self, id: u64) -> TxResult<TransactionRecord> {
        let original = self.get_record(id).await?;
        if original.status != TxStatus::Submitted {
            return Err(TxError::Validation(format!(
                "transaction {} is {} and cannot be replaced",
                id, original.status
            )));
        }
        if original.nonce().is_none() {
            return Err(TxError::Validation(format!("transaction {} has no nonce", id)));
        }
        Ok(original)
    }

    async fn last_gas_price(&self, original: &TransactionRecord) -> TxResult<U256> {
        match original.tx_params.gas_price {
            Some(price) => Ok(price),
            None => self.gas.suggest_gas_price(&original.chain).await,
        }
    }

    async fn add_replacement(
        &self,
        original: &TransactionRecord,
        tx_type: TxType,
        params: TxParams,
        last_gas_price: U256,
    ) -> TxResult<TransactionRecord> {
        let adapter = self.chains.get(&original.chain)?;

        let mut record =
            TransactionRecord::new(original.chain.clone(), tx_type, params, original.origin.clone());
        if adapter.requires_expiration() {
            record.tx_params.expiration_timestamp_secs = Some(
                self.gas
                    .get_expiration_timestamp_secs(&record.chain, None)
                    .await?,
            );
        }
        record.last_gas_price = Some(last_gas_price);
        record.original_tx_id = Some(original.id);

        let record = self.store.add_tx(record).await?;
        info!(
            "Created {} transaction {} replacing {} at nonce {:?}",
            tx_type.as_str(),
            record.id,
            original.id,
            record.nonce()
        );
        crate::metrics::record_tx_added(&record.chain, tx_type);

        self.store.set_tx_status_approved(record.id).await?;
        self.approve_transaction(record.id).await?;
        self.get_record(record.id).await
    }

    /// Mark a transaction confirmed and drop every other record that claimed its nonce.
    ///
    /// Confirming an already confirmed record does nothing.
    pub async fn confirm_transaction(&self, id: u64, receipt: TxReceipt) -> TxResult<()> {
        let record = self.get_record(id).await?;
        if record.status == TxStatus::Confirmed {
            debug!("Transaction {} already confirmed", id);
            return Ok(());
        }

        let confirmed = self.store.set_tx_status_confirmed(id, receipt).await?;
        let latency = confirmed
            .submitted_time
            .map(|sent| (Utc::now() - sent).num_milliseconds() as f64 / 1000.0);
        crate::metrics::record_tx_confirmed(&confirmed.chain, latency);
        info!("Transaction {} confirmed: {:?}", id, confirmed.hash);

        self.drop_siblings(&confirmed).await;
        Ok(())
    }

    async fn drop_siblings(&self, confirmed: &TransactionRecord) {
        let Some(nonce) = confirmed.nonce() else {
            return;
        };

        let siblings = self
            .store
            .get_filtered_tx_list(&TxFilter {
                from: Some(confirmed.from()),
                chain: Some(confirmed.chain.clone()),
                nonce: Some(nonce),
                ..Default::default()
            })
            .await;

        for sibling in siblings.iter().filter(|s| s.id != confirmed.id) {
            if matches!(
                sibling.status,
                TxStatus::Unapproved | TxStatus::Confirmed | TxStatus::Dropped | TxStatus::Rejected
            ) {
                continue;
            }

            match self
                .store
                .set_tx_status_dropped_sibling(sibling.id, confirmed.hash)
                .await
            {
                Ok(_) => {
                    info!(
                        "Transaction {} dropped, nonce {} used by {}",
                        sibling.id, nonce, confirmed.id
                    );
                    crate::metrics::record_tx_dropped(&sibling.chain);
                }
                Err(e) => debug!("Could not drop sibling {}: {}", sibling.id, e),
            }
        }
    }

    async fn fail_transaction(&self, id: u64, error: &TxError) {
        match self.store.set_tx_status_failed(id, error.to_string()).await {
            Ok(record) => {
                crate::metrics::record_tx_failed(&record.chain);
                if error.should_alert() {
                    error!("Transaction {} failed: {}", id, error);
                }
            }
            Err(e) => debug!("Transaction {} not marked failed: {}", id, e),
        }
    }

    pub async fn get_pending_tx_count(&self, address: Option<Address>) -> usize {
        self.store.get_pending_transactions(address).await.len()
    }

    pub async fn get_unapproved_tx_count(&self) -> usize {
        self.store.get_unapproved_tx_list().await.len()
    }

    /// Remove all records sent from `address`
    pub async fn wipe_transactions(&self, address: Address) -> usize {
        let removed = self.store.wipe_transactions(address).await;
        info!("Wiped {} transactions for {:?}", removed, address);
        removed
    }

    /// Drop requests that were waiting for approval on the previous network
    pub async fn on_network_switch(&self) -> usize {
        let cleared = self.store.clear_unapproved_txs().await;
        info!("Network switched, cleared {} unapproved transactions", cleared);
        cleared
    }

    /// One tracker pass for a new block on `chain`
    pub async fn process_block(&self, chain: &ChainSelector, block_height: u64) {
        let _scan = self.nonce_tracker.get_global_lock().await;
        debug!("Processing block {} on {}", block_height, chain);

        let events = self.tracker.update_pending_txs(chain).await;
        self.apply_tracker_events(events).await;

        let events = self.tracker.resubmit_pending_txs(chain, block_height).await;
        self.apply_tracker_events(events).await;

        let events = self.tracker.check_unknown_txs(chain).await;
        self.apply_tracker_events(events).await;
    }

    /// Re-query transactions whose status became unknown while offline
    pub async fn update_unknown_txs(&self, chain: &ChainSelector) {
        let _scan = self.nonce_tracker.get_global_lock().await;
        let events = self.tracker.check_unknown_txs(chain).await;
        self.apply_tracker_events(events).await;
    }

    /// Mark transactions on `chain` pending longer than the offline timeout as unknown
    pub async fn handle_pending_txs_offline(&self, chain: &ChainSelector) {
        let _scan = self.nonce_tracker.get_global_lock().await;
        let timeout = ChronoDuration::seconds(self.config.offline_timeout_secs as i64);
        let events = self.tracker.check_offline_txs(chain, Utc::now(), timeout).await;
        self.apply_tracker_events(events).await;
    }

    async fn apply_tracker_events(&self, events: Vec<TrackerEvent>) {
        for event in events {
            let id = event.id();
            if let Err(e) = self.apply_tracker_event(event).await {
                warn!("Failed to apply tracker result for transaction {}: {}", id, e);
            }
        }
    }

    async fn apply_tracker_event(&self, event: TrackerEvent) -> TxResult<()> {
        match event {
            TrackerEvent::Confirmed { id, receipt } => self.confirm_transaction(id, receipt).await,
            TrackerEvent::Failed { id, error } => {
                let record = self.store.set_tx_status_failed(id, error).await?;
                crate::metrics::record_tx_failed(&record.chain);
                Ok(())
            }
            TrackerEvent::Dropped { id } => {
                let record = self.store.set_tx_status_dropped(id).await?;
                crate::metrics::record_tx_dropped(&record.chain);
                Ok(())
            }
            TrackerEvent::Warning { id, error, message } => {
                let warning = TxWarning {
                    error: error.clone(),
                    message,
                };
                let record = self
                    .modify_record(id, "transaction warning", |r| r.warning = Some(warning))
                    .await?;
                self.store.emit(TxEvent::Warning {
                    record: Box::new(record),
                    error,
                });
                Ok(())
            }
            TrackerEvent::BlockUpdate { id, block_height } => {
                let record = self
                    .modify_record(id, "first block after submission", |r| {
                        r.first_retry_block_height = Some(block_height)
                    })
                    .await?;
                self.store.emit(TxEvent::BlockUpdate {
                    record: Box::new(record),
                    block_height,
                });
                Ok(())
            }
            TrackerEvent::Retry { id } => {
                let record = self
                    .modify_record(id, "resubmitted", |r| r.retry_count += 1)
                    .await?;
                crate::metrics::record_tx_resubmitted(&record.chain);
                self.store.emit(TxEvent::Retry {
                    record: Box::new(record),
                });
                Ok(())
            }
            TrackerEvent::Unknown { id } => {
                warn!("Transaction {} pending too long, status unknown", id);
                self.store.set_tx_status_unknown(id).await.map(|_| ())
            }
            TrackerEvent::Resumed { id } => self.store.set_tx_status_resumed(id).await.map(|_| ()),
        }
    }

    async fn modify_record<F>(&self, id: u64, note: &str, mutate: F) -> TxResult<TransactionRecord>
    where
        F: FnOnce(&mut TransactionRecord),
    {
        let mut record = self.get_record(id).await?;
        mutate(&mut record);
        self.store.update_tx(&record, note).await?;
        self.get_record(id).await
    }

    /// Records on `chain` the tracker still has to follow
    async fn tracked_count(&self, chain: &ChainSelector) -> usize {
        self.store
            .get_filtered_tx_list(&TxFilter {
                chain: Some(chain.clone()),
                ..Default::default()
            })
            .await
            .iter()
            .filter(|t| matches!(t.status, TxStatus::Submitted | TxStatus::Unknown))
            .count()
    }

    /// Drive the tracker from `block_tracker` until [`stop`](Self::stop) is called.
    ///
    /// The block subscription is only held while something on `chain` is pending.
    pub async fn run(&self, chain: ChainSelector, block_tracker: Arc<dyn BlockTracker>) {
        info!("Transaction controller tracking chain {}", chain);

        let mut events = self.store.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        let mut blocks: Option<broadcast::Receiver<u64>> = None;
        let mut offline_check = tokio::time::interval(OFFLINE_CHECK_INTERVAL);
        let offline_timeout = Duration::from_secs(self.config.offline_timeout_secs);
        let mut last_block_at = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let tracking = self.tracked_count(&chain).await > 0;
            if tracking && blocks.is_none() {
                debug!("Subscribing to new blocks on {}", chain);
                blocks = Some(block_tracker.subscribe());
                last_block_at = Instant::now();
                if let Some(height) = block_tracker.latest_block() {
                    self.process_block(&chain, height).await;
                }
            } else if !tracking && blocks.is_some() {
                debug!("Nothing pending on {}, unsubscribing from blocks", chain);
                blocks = None;
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                event = events.recv() => {
                    if let Err(RecvError::Closed) = event {
                        break;
                    }
                }
                height = next_block(&mut blocks) => {
                    if let Some(height) = height {
                        last_block_at = Instant::now();
                        self.process_block(&chain, height).await;
                    }
                }
                _ = offline_check.tick() => {
                    if blocks.is_some() && last_block_at.elapsed() > offline_timeout {
                        warn!("No new blocks on {} for {:?}", chain, last_block_at.elapsed());
                        self.handle_pending_txs_offline(&chain).await;
                    }
                }
            }
        }

        info!("Transaction controller stopped");
    }

    /// Stop the run loop
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

async fn next_block(blocks: &mut Option<broadcast::Receiver<u64>>) -> Option<u64> {
    let Some(rx) = blocks.as_mut() else {
        return std::future::pending().await;
    };

    match rx.recv().await {
        Ok(height) => Some(height),
        Err(RecvError::Lagged(skipped)) => {
            debug!("Skipped {} block notifications", skipped);
            None
        }
        Err(RecvError::Closed) => {
            *blocks = None;
            None
        }
    }
}
