use std::{sync::Arc, time::Duration};

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use tessera_core::{attestation::SignatureAggregation, batch::BatchHeader, DynError};

/// A prepared chain transaction. Gas fields are mutable so the manager can
/// replace a stalled submission with a higher-priced copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub to: Address,
    pub data: Vec<u8>,
    pub value: U256,
    pub gas_limit: u64,
    pub gas_price: U256,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Log {
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionReceipt {
    pub txn_hash: B256,
    pub block_number: Option<u64>,
    pub logs: Vec<Log>,
}

/// Narrow chain RPC surface the pipeline consumes.
#[async_trait]
pub trait EthClient: Send + Sync + 'static {
    async fn estimate_gas(&self, txn: &Transaction) -> Result<u64, DynError>;

    async fn send_transaction(&self, txn: &Transaction) -> Result<B256, DynError>;

    /// `Ok(None)` means the transaction is unknown to the chain, which after
    /// finality indicates it was reorged out.
    async fn transaction_receipt(&self, hash: B256)
        -> Result<Option<TransactionReceipt>, DynError>;

    /// Number of the latest finalized block
    /// (`eth_getBlockByNumber("finalized", false)`).
    async fn latest_finalized_block(&self) -> Result<u64, DynError>;
}

/// Builds the confirm-batch transaction against the service contract.
#[async_trait]
pub trait Transactor: Send + Sync + 'static {
    async fn build_confirm_batch_txn(
        &self,
        batch_header: &BatchHeader,
        aggregation: &SignatureAggregation,
    ) -> Result<Transaction, DynError>;
}

/// A submission request. `metadata` is opaque to the manager and echoed
/// back intact on the receipt channel so callers can correlate replies.
pub struct TxnRequest<M> {
    pub txn: Transaction,
    pub label: &'static str,
    pub value: U256,
    pub metadata: M,
}

/// Receipt or terminal error for one request, delivered asynchronously.
pub struct ReceiptResponse<M> {
    pub result: Result<TransactionReceipt, DynError>,
    pub metadata: M,
}

#[derive(Debug, Error)]
pub enum TxnManagerError {
    #[error("transaction manager is not running")]
    NotRunning,
}

#[async_trait]
pub trait TxnManager<M: Send + 'static>: Send + Sync {
    async fn process_transaction(&self, request: TxnRequest<M>) -> Result<(), TxnManagerError>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxnManagerSettings {
    /// Per-attempt deadline before the gas price is bumped.
    pub chain_write_timeout: Duration,
    pub receipt_poll_interval: Duration,
    /// Percentage added to the gas price on each replacement.
    pub gas_replacement_percentage: u64,
    /// Replacements attempted before the submission is reported failed.
    pub max_speedups: u32,
}

impl Default for TxnManagerSettings {
    fn default() -> Self {
        Self {
            chain_write_timeout: Duration::from_secs(90),
            receipt_poll_interval: Duration::from_secs(3),
            gas_replacement_percentage: 10,
            max_speedups: 3,
        }
    }
}

/// Serializes submissions, monitors inclusion, bumps gas on stall, and
/// publishes receipts on an asynchronous channel. Knows nothing about the
/// batcher; the receipt channel is the only coupling.
pub struct GasPriceTxnManager<M, E> {
    eth_client: Arc<E>,
    settings: TxnManagerSettings,
    request_tx: mpsc::UnboundedSender<TxnRequest<M>>,
    request_rx: Mutex<Option<mpsc::UnboundedReceiver<TxnRequest<M>>>>,
    receipt_tx: mpsc::UnboundedSender<ReceiptResponse<M>>,
}

impl<M, E> GasPriceTxnManager<M, E>
where
    M: Send + 'static,
    E: EthClient,
{
    pub fn new(
        eth_client: Arc<E>,
        settings: TxnManagerSettings,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ReceiptResponse<M>>) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (receipt_tx, receipt_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                eth_client,
                settings,
                request_tx,
                request_rx: Mutex::new(Some(request_rx)),
                receipt_tx,
            }),
            receipt_rx,
        )
    }

    /// Spawn the worker draining the request queue. Requests are handled
    /// one at a time; in-flight transactions are never cancelled, so a
    /// receipt may arrive after shutdown and is then dropped by the closed
    /// receipt channel.
    pub async fn start(self: &Arc<Self>) {
        let mut request_rx = self
            .request_rx
            .lock()
            .await
            .take()
            .expect("transaction manager started twice");
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                let metadata = request.metadata;
                let result = manager
                    .monitor_transaction(request.txn, request.label)
                    .await;
                if manager
                    .receipt_tx
                    .send(ReceiptResponse { result, metadata })
                    .is_err()
                {
                    debug!("receipt dropped, no consumer on the channel");
                }
            }
        });
    }

    async fn monitor_transaction(
        &self,
        mut txn: Transaction,
        label: &'static str,
    ) -> Result<TransactionReceipt, DynError> {
        if txn.gas_limit == 0 {
            txn.gas_limit = self.eth_client.estimate_gas(&txn).await?;
        }
        let mut speedups = 0u32;
        loop {
            let hash = self.eth_client.send_transaction(&txn).await?;
            info!(label, %hash, gas_price = %txn.gas_price, "submitted transaction");
            if let Some(receipt) = self.wait_for_receipt(hash).await? {
                return Ok(receipt);
            }
            if speedups >= self.settings.max_speedups {
                return Err(format!(
                    "transaction {label} stalled after {speedups} gas replacements"
                )
                .into());
            }
            speedups += 1;
            txn.gas_price = txn.gas_price
                * U256::from(100 + self.settings.gas_replacement_percentage)
                / U256::from(100u64);
            warn!(
                label,
                speedups,
                gas_price = %txn.gas_price,
                "transaction not mined within the write timeout, replacing with higher gas"
            );
        }
    }

    async fn wait_for_receipt(
        &self,
        hash: B256,
    ) -> Result<Option<TransactionReceipt>, DynError> {
        let deadline = tokio::time::Instant::now() + self.settings.chain_write_timeout;
        loop {
            if let Some(receipt) = self.eth_client.transaction_receipt(hash).await? {
                return Ok(Some(receipt));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.settings.receipt_poll_interval).await;
        }
    }
}

#[async_trait]
impl<M, E> TxnManager<M> for GasPriceTxnManager<M, E>
where
    M: Send + 'static,
    E: EthClient,
{
    async fn process_transaction(&self, request: TxnRequest<M>) -> Result<(), TxnManagerError> {
        self.request_tx
            .send(request)
            .map_err(|_| TxnManagerError::NotRunning)
    }
}
