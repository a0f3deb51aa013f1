use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use alloy_primitives::U256;
use alloy_sol_types::{sol, SolEvent as _};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::{debug, error, info, warn};

use tessera_core::{
    attestation::{compute_signatory_record_hash, QuorumResult},
    blob::{BlobHeader, BlobMetadata, ConfirmationInfo},
    encoding::Encoder,
    merkle::MerkleTree,
    operators::QuorumId,
    AssignmentCoordinator, IndexedChainState, SignatureAggregation,
};

use crate::{
    aggregator::{AggregationError, SignatureAggregator},
    dispatcher::Dispatcher,
    finalizer::Finalizer,
    store::{BlobStore, StoreError},
    streamer::{
        BatchError, EncodedSizeNotifier, EncodingStreamer, StreamerConfig,
    },
    txn_manager::{
        EthClient, ReceiptResponse, TransactionReceipt, Transactor, TxnManager, TxnManagerError,
        TxnRequest,
    },
};

sol! {
    event BatchConfirmed(bytes32 indexed batchHeaderHash, uint32 batchId);
}

const BATCH_ID_MAX_RETRIES: u32 = 4;
const BATCH_ID_BASE_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct BatcherConfig {
    /// Batch loop tick period.
    pub pull_interval: Duration,
    /// Accumulated encoded size that triggers an early batch, in MB.
    pub batch_size_mb_limit: u64,
    pub max_num_retries_per_blob: u32,
    /// Encoding worker pool width.
    pub num_connections: usize,
    pub encoding_request_queue_size: usize,
    pub target_num_chunks: u32,
    pub max_blobs_to_fetch_from_store: usize,
    pub finalizer_interval: Duration,
    pub finalizer_pool_size: usize,
}

#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct TimeoutConfig {
    pub encoding_timeout: Duration,
    pub attestation_timeout: Duration,
    pub chain_read_timeout: Duration,
    pub chain_write_timeout: Duration,
}

/// Why a batch (or blob) went through the failure path; logged only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailReason {
    AggregateSignatures,
    NoSignatures,
    ConfirmBatch,
    UpdateConfirmationInfo,
}

#[derive(Debug, Error)]
pub enum BatcherError {
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
    #[error("no blobs received sufficient signatures")]
    NoBlobsAttested,
    #[error("failed to build confirm batch transaction: {0}")]
    Transactor(String),
    #[error(transparent)]
    TxnManager(#[from] TxnManagerError),
    #[error("failed to confirm batch onchain: {0}")]
    ConfirmationFailed(String),
    #[error("transaction metadata carries no blobs")]
    EmptyBatchMetadata,
    #[error("transaction receipt has no block number")]
    MissingBlockNumber,
    #[error("no BatchConfirmed log found in the receipt")]
    MissingBatchConfirmedLog,
    #[error("failed to decode BatchConfirmed log: {0}")]
    LogDecode(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything needed to finish a batch once its confirmation receipt
/// arrives. Travels through the transaction manager as opaque metadata;
/// immutable once enqueued.
#[derive(Clone)]
pub struct ConfirmationMetadata {
    pub batch_header: tessera_core::batch::BatchHeader,
    pub blobs: Vec<BlobMetadata>,
    pub blob_headers: Vec<BlobHeader>,
    pub merkle_tree: Arc<MerkleTree>,
    pub aggregation: Arc<SignatureAggregation>,
}

/// Drives blobs through dispersal: pulls encoded results into batches,
/// dispatches chunks, aggregates attestations, anchors confirmations on
/// chain, and tracks per-blob lifecycle with bounded retries.
pub struct Batcher<S, D, C, T, TM> {
    config: BatcherConfig,
    timeouts: TimeoutConfig,
    blob_store: Arc<S>,
    dispatcher: Arc<D>,
    transactor: Arc<T>,
    txn_manager: Arc<TM>,
    eth_client: Arc<dyn EthClient>,
    finalizer: Arc<dyn Finalizer>,
    aggregator: SignatureAggregator,
    pub streamer: Arc<EncodingStreamer<S, C>>,
    batch_trigger: Mutex<Option<mpsc::Receiver<()>>>,
    heartbeat: mpsc::Sender<Instant>,
}

impl<S, D, C, T, TM> Batcher<S, D, C, T, TM>
where
    S: BlobStore,
    D: Dispatcher,
    C: IndexedChainState + 'static,
    T: Transactor,
    TM: TxnManager<ConfirmationMetadata> + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BatcherConfig,
        timeouts: TimeoutConfig,
        blob_store: Arc<S>,
        dispatcher: Arc<D>,
        chain_state: Arc<C>,
        encoder: Arc<dyn Encoder>,
        assignment_coordinator: Arc<dyn AssignmentCoordinator>,
        transactor: Arc<T>,
        txn_manager: Arc<TM>,
        eth_client: Arc<dyn EthClient>,
        finalizer: Arc<dyn Finalizer>,
        heartbeat: mpsc::Sender<Instant>,
    ) -> Self {
        let (notifier, batch_trigger) =
            EncodedSizeNotifier::new(config.batch_size_mb_limit * 1024 * 1024);
        let streamer_config = StreamerConfig {
            encoding_timeout: timeouts.encoding_timeout,
            chain_read_timeout: timeouts.chain_read_timeout,
            encoding_request_interval: config.pull_interval,
            encoding_queue_limit: config.encoding_request_queue_size,
            num_connections: config.num_connections,
            target_num_chunks: config.target_num_chunks,
            max_blobs_to_fetch_from_store: config.max_blobs_to_fetch_from_store,
            max_num_retries_per_blob: config.max_num_retries_per_blob,
        };
        let streamer = Arc::new(EncodingStreamer::new(
            streamer_config,
            Arc::clone(&blob_store),
            chain_state,
            encoder,
            assignment_coordinator,
            notifier,
        ));
        Self {
            config,
            timeouts,
            blob_store,
            dispatcher,
            transactor,
            txn_manager,
            eth_client,
            finalizer,
            aggregator: SignatureAggregator,
            streamer,
            batch_trigger: Mutex::new(Some(batch_trigger)),
            heartbeat,
        }
    }

    /// Launch the three long-lived loops: encoding, receipt handling, and
    /// batch creation (plus the finalizer). All stop at their next
    /// suspension point once `shutdown` flips.
    pub fn start(
        self: &Arc<Self>,
        mut receipts: mpsc::UnboundedReceiver<ReceiptResponse<ConfirmationMetadata>>,
        shutdown: watch::Receiver<bool>,
    ) {
        Arc::clone(&self.streamer).start(shutdown.clone());
        Arc::clone(&self.finalizer).start(shutdown.clone());

        let batcher = Arc::clone(self);
        let mut receipt_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = receipt_shutdown.changed() => break,
                    response = receipts.recv() => {
                        let Some(response) = response else { break };
                        if let Err(e) = batcher.process_confirmed_batch(response).await {
                            error!(err = %e, "failed to process confirmed batch");
                        }
                    }
                }
            }
        });

        let batcher = Arc::clone(self);
        let mut loop_shutdown = shutdown;
        tokio::spawn(async move {
            let mut batch_trigger = batcher
                .batch_trigger
                .lock()
                .expect("batch trigger lock poisoned")
                .take()
                .expect("batcher started twice");
            let mut ticker = tokio::time::interval(batcher.config.pull_interval);
            loop {
                tokio::select! {
                    _ = loop_shutdown.changed() => break,
                    _ = ticker.tick() => batcher.run_batch_iteration().await,
                    Some(()) = batch_trigger.recv() => {
                        batcher.run_batch_iteration().await;
                        ticker.reset();
                    }
                }
            }
        });
    }

    async fn run_batch_iteration(&self) {
        match self.handle_single_batch().await {
            Ok(()) => {}
            Err(BatcherError::Batch(BatchError::NoEncodedResults)) => {
                warn!("no encoded results to make a batch with");
            }
            Err(e) => error!(err = %e, "failed to process a batch"),
        }
    }

    /// One full dispersal round: batch, dispatch, aggregate, submit the
    /// confirmation transaction, and mark chunks pending confirmation.
    pub async fn handle_single_batch(&self) -> Result<(), BatcherError> {
        self.signal_liveness();

        let batch = self.streamer.create_batch().await?;
        let replies = self
            .dispatcher
            .disperse_batch(
                Arc::clone(&batch.state),
                batch.encoded_blobs.clone(),
                batch.batch_header,
            )
            .await;

        let header_hash = batch.batch_header.batch_header_hash();
        let mut quorum_thresholds: BTreeMap<QuorumId, u8> = BTreeMap::new();
        for header in &batch.blob_headers {
            for quorum_info in &header.quorum_infos {
                let entry = quorum_thresholds.entry(quorum_info.quorum_id()).or_insert(0);
                *entry = (*entry).max(quorum_info.security_param.quorum_threshold);
            }
        }

        let aggregation = match self
            .aggregator
            .aggregate_signatures(
                &batch.state,
                &quorum_thresholds,
                header_hash,
                replies,
                self.timeouts.attestation_timeout,
            )
            .await
        {
            Ok(aggregation) => aggregation,
            Err(err) => {
                self.handle_failure(&batch.blob_metadata, FailReason::AggregateSignatures)
                    .await;
                return Err(err.into());
            }
        };
        for result in aggregation.quorum_results.values() {
            info!(
                quorum_id = result.quorum_id,
                percent_signed = result.percent_signed,
                "aggregated quorum result"
            );
        }

        let num_passed = num_blobs_attested(&aggregation.quorum_results, &batch.blob_headers);
        if num_passed == 0 {
            self.handle_failure(&batch.blob_metadata, FailReason::NoSignatures)
                .await;
            return Err(BatcherError::NoBlobsAttested);
        }

        let txn = match self
            .transactor
            .build_confirm_batch_txn(&batch.batch_header, &aggregation)
            .await
        {
            Ok(txn) => txn,
            Err(err) => {
                self.handle_failure(&batch.blob_metadata, FailReason::ConfirmBatch)
                    .await;
                return Err(BatcherError::Transactor(err.to_string()));
            }
        };
        let request = TxnRequest {
            txn,
            label: "confirm_batch",
            value: U256::ZERO,
            metadata: ConfirmationMetadata {
                batch_header: batch.batch_header,
                blobs: batch.blob_metadata.clone(),
                blob_headers: batch.blob_headers.clone(),
                merkle_tree: Arc::clone(&batch.merkle_tree),
                aggregation: Arc::new(aggregation),
            },
        };
        if let Err(err) = self.txn_manager.process_transaction(request).await {
            self.handle_failure(&batch.blob_metadata, FailReason::ConfirmBatch)
                .await;
            return Err(err.into());
        }

        for metadata in &batch.blob_metadata {
            self.streamer.mark_blob_pending_confirmation(metadata);
        }
        Ok(())
    }

    /// Finish a batch whose confirmation receipt (or submission error) has
    /// arrived from the transaction manager.
    pub async fn process_confirmed_batch(
        &self,
        response: ReceiptResponse<ConfirmationMetadata>,
    ) -> Result<(), BatcherError> {
        let metadata = response.metadata;
        if metadata.blobs.is_empty() {
            return Err(BatcherError::EmptyBatchMetadata);
        }
        let receipt = match response.result {
            Ok(receipt) => receipt,
            Err(err) => {
                self.handle_failure(&metadata.blobs, FailReason::ConfirmBatch)
                    .await;
                return Err(BatcherError::ConfirmationFailed(err.to_string()));
            }
        };
        info!(
            block_number = receipt.block_number,
            txn_hash = %receipt.txn_hash,
            "received confirm batch transaction receipt"
        );

        match self.update_confirmation_info(&metadata, &receipt).await {
            Ok(blobs_to_retry) => {
                if !blobs_to_retry.is_empty() {
                    error!(
                        failed = blobs_to_retry.len(),
                        total = metadata.blobs.len(),
                        "failed to update confirmation info for some blobs"
                    );
                    self.handle_failure(&blobs_to_retry, FailReason::UpdateConfirmationInfo)
                        .await;
                }
                Ok(())
            }
            Err(err) => {
                self.handle_failure(&metadata.blobs, FailReason::UpdateConfirmationInfo)
                    .await;
                Err(err)
            }
        }
    }

    async fn update_confirmation_info(
        &self,
        metadata: &ConfirmationMetadata,
        receipt: &TransactionReceipt,
    ) -> Result<Vec<BlobMetadata>, BatcherError> {
        let confirmation_block_number = receipt
            .block_number
            .ok_or(BatcherError::MissingBlockNumber)? as u32;
        let batch_header_hash = metadata.batch_header.batch_header_hash();
        let batch_id = self.get_batch_id(receipt).await?;
        let signatory_record_hash = compute_signatory_record_hash(
            metadata.batch_header.reference_block_number,
            &metadata.aggregation.non_signers,
        );

        let mut blobs_to_retry = Vec::new();
        for (blob_index, blob_metadata) in metadata.blobs.iter().enumerate() {
            let header = &metadata.blob_headers[blob_index];
            let attested = is_blob_attested(&metadata.aggregation.quorum_results, header);

            let proof = match metadata.merkle_tree.proof(blob_index) {
                Ok(proof) => proof,
                Err(err) => {
                    error!(err = %err, blob_index, "failed to generate blob inclusion proof");
                    blobs_to_retry.push(blob_metadata.clone());
                    continue;
                }
            };
            let info = ConfirmationInfo {
                batch_header_hash,
                blob_index: blob_index as u32,
                signatory_record_hash,
                reference_block_number: metadata.batch_header.reference_block_number,
                batch_root: metadata.batch_header.batch_root,
                blob_inclusion_proof: proof,
                blob_commitments: header.commitments.clone(),
                batch_id,
                confirmation_txn_hash: receipt.txn_hash,
                confirmation_block_number,
                fee: vec![0],
                quorum_results: metadata.aggregation.quorum_results.clone(),
                blob_quorum_infos: header.quorum_infos.clone(),
            };

            let marked = if attested {
                self.blob_store
                    .mark_blob_confirmed(blob_metadata, &info)
                    .await
            } else {
                self.blob_store
                    .mark_blob_insufficient_signatures(blob_metadata, &info)
                    .await
            };
            match marked {
                Ok(_) => self.streamer.remove_encoded_blob(blob_metadata),
                Err(err) => {
                    error!(err = %err, blob = %blob_metadata.blob_key, "failed to update blob confirmation");
                    blobs_to_retry.push(blob_metadata.clone());
                }
            }
        }
        Ok(blobs_to_retry)
    }

    /// Extract the on-chain batch id from the `BatchConfirmed` log,
    /// re-fetching the receipt with exponential backoff on parse failure.
    async fn get_batch_id(&self, receipt: &TransactionReceipt) -> Result<u32, BatcherError> {
        let mut last_err = match parse_batch_id_from_receipt(receipt) {
            Ok(batch_id) => return Ok(batch_id),
            Err(err) => err,
        };
        let txn_hash = receipt.txn_hash;
        for attempt in 0..BATCH_ID_MAX_RETRIES {
            let delay = BATCH_ID_BASE_DELAY * 2u32.pow(attempt);
            warn!(err = %last_err, retry_in = ?delay, "failed to parse batch id, re-fetching receipt");
            tokio::time::sleep(delay).await;

            match self.eth_client.transaction_receipt(txn_hash).await {
                Ok(Some(fresh)) => match parse_batch_id_from_receipt(&fresh) {
                    Ok(batch_id) => return Ok(batch_id),
                    Err(err) => last_err = err,
                },
                Ok(None) => {}
                Err(err) => {
                    debug!(err = %err, "receipt re-fetch failed");
                }
            }
        }
        warn!(err = %last_err, retries = BATCH_ID_MAX_RETRIES, "failed to get batch id after retries");
        Err(last_err)
    }

    /// Retry accounting for a set of blobs: purge their encodings and either
    /// revert them to `Processing` or mark them `Failed`.
    async fn handle_failure(&self, blobs: &[BlobMetadata], reason: FailReason) {
        warn!(?reason, num_blobs = blobs.len(), "handling batch failure");
        for metadata in blobs {
            self.streamer.remove_encoded_blob(metadata);
            if let Err(err) = self
                .blob_store
                .handle_blob_failure(metadata, self.config.max_num_retries_per_blob)
                .await
            {
                error!(err = %err, blob = %metadata.blob_key, "error handling blob failure");
            }
        }
    }

    /// Best-effort liveness signal; never blocks the loop.
    fn signal_liveness(&self) {
        match self.heartbeat.try_send(Instant::now()) {
            Ok(()) => debug!("heartbeat signal sent"),
            Err(_) => warn!("heartbeat signal skipped, no receiver on the channel"),
        }
    }
}

pub fn parse_batch_id_from_receipt(receipt: &TransactionReceipt) -> Result<u32, BatcherError> {
    for log in &receipt.logs {
        let Some(topic) = log.topics.first() else {
            debug!("transaction receipt log has no topics");
            continue;
        };
        if *topic != BatchConfirmed::SIGNATURE_HASH {
            continue;
        }
        let (batch_id,) = BatchConfirmed::abi_decode_data(&log.data, true)
            .map_err(|err| BatcherError::LogDecode(err.to_string()))?;
        return Ok(batch_id);
    }
    Err(BatcherError::MissingBatchConfirmedLog)
}

/// A blob is attested when every quorum it requested signed past that
/// quorum's threshold.
fn is_blob_attested(
    quorum_results: &BTreeMap<QuorumId, QuorumResult>,
    header: &BlobHeader,
) -> bool {
    header.quorum_infos.iter().all(|info| {
        quorum_results
            .get(&info.quorum_id())
            .is_some_and(|result| {
                result.percent_signed >= info.security_param.quorum_threshold
            })
    })
}

fn num_blobs_attested(
    quorum_results: &BTreeMap<QuorumId, QuorumResult>,
    headers: &[BlobHeader],
) -> usize {
    headers
        .iter()
        .filter(|header| is_blob_attested(quorum_results, header))
        .count()
}

#[cfg(test)]
mod test {
    use alloy_primitives::B256;
    use alloy_sol_types::SolEvent as _;

    use super::*;

    #[test]
    fn parse_batch_id() {
        let mut data = vec![0u8; 32];
        data[31] = 3;
        let receipt = TransactionReceipt {
            txn_hash: B256::repeat_byte(1),
            block_number: Some(123),
            logs: vec![crate::txn_manager::Log {
                topics: vec![BatchConfirmed::SIGNATURE_HASH, B256::repeat_byte(9)],
                data,
            }],
        };
        assert_eq!(parse_batch_id_from_receipt(&receipt).unwrap(), 3);
    }

    #[test]
    fn parse_batch_id_rejects_missing_log() {
        let receipt = TransactionReceipt {
            txn_hash: B256::repeat_byte(1),
            block_number: Some(123),
            logs: vec![],
        };
        assert!(matches!(
            parse_batch_id_from_receipt(&receipt),
            Err(BatcherError::MissingBatchConfirmedLog)
        ));
    }
}
