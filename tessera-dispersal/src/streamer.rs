use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};

use tessera_core::{
    assignment::{AssignmentCoordinator, AssignmentError},
    batch::BatchHeader,
    blob::{BlobHeader, BlobKey, BlobMetadata, BlobQuorumInfo, QUANTIZATION_FACTOR},
    encoding::Encoder,
    merkle::{MerkleError, MerkleTree},
    operators::{IndexedOperatorState, QuorumId},
    IndexedChainState,
};
use tessera_kzgrs::{num_field_elements, EncodingParams};

use crate::{
    dispatcher::{Bundles, EncodedBlob},
    encoded_store::{EncodedBlobStore, EncodedResultStatus, EncodingResult},
    store::{BlobStore, StoreError},
};

#[derive(Clone, Debug)]
pub struct StreamerConfig {
    /// Deadline for one encoding job's store and chain reads.
    pub encoding_timeout: Duration,
    /// Deadline for the streamer's own chain reads.
    pub chain_read_timeout: Duration,
    /// How often the driver scans for new `Processing` blobs.
    pub encoding_request_interval: Duration,
    /// Cap on encode requests in flight.
    pub encoding_queue_limit: usize,
    /// Worker pool width.
    pub num_connections: usize,
    /// Sizing hint for the chunk length derivation.
    pub target_num_chunks: u32,
    pub max_blobs_to_fetch_from_store: usize,
    pub max_num_retries_per_blob: u32,
}

#[derive(Debug, Error)]
pub enum StreamerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("chain state unavailable: {0}")]
    ChainState(String),
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("no encoded results")]
    NoEncodedResults,
    #[error("chain state unavailable: {0}")]
    ChainState(String),
    #[error(transparent)]
    Merkle(#[from] MerkleError),
    #[error(transparent)]
    Assignment(#[from] AssignmentError),
}

/// Result of one encoding job, delivered to the driver over a channel so
/// all encoded-store mutations happen in one place.
#[derive(Debug)]
pub enum EncodingOutcome {
    Encoded(Box<EncodingResult>),
    Failed {
        metadata: BlobMetadata,
        quorum_id: QuorumId,
        error: String,
    },
}

/// Edge trigger for early batches: fires once when the accumulated encoded
/// size crosses the threshold, then stays quiet until re-armed. The channel
/// has capacity one and sends never block; redundant notifications drop.
pub struct EncodedSizeNotifier {
    notify: mpsc::Sender<()>,
    threshold_bytes: u64,
    active: AtomicBool,
}

impl EncodedSizeNotifier {
    #[must_use]
    pub fn new(threshold_bytes: u64) -> (Self, mpsc::Receiver<()>) {
        let (notify, receiver) = mpsc::channel(1);
        (
            Self {
                notify,
                threshold_bytes,
                active: AtomicBool::new(true),
            },
            receiver,
        )
    }

    pub fn update(&self, total_encoded_bytes: u64) {
        if total_encoded_bytes >= self.threshold_bytes
            && self.active.swap(false, Ordering::AcqRel)
        {
            info!(
                total_encoded_bytes,
                threshold = self.threshold_bytes,
                "encoded size threshold reached, triggering early batch"
            );
            let _ = self.notify.try_send(());
        }
    }

    pub fn reset(&self) {
        self.active.store(true, Ordering::Release);
    }
}

/// An immutable snapshot of everything needed to disperse and confirm one
/// batch. Blob order is the dispersal order the Merkle tree was built in
/// and must survive unchanged through confirmation handling.
#[derive(Debug)]
pub struct Batch {
    pub batch_header: BatchHeader,
    pub blob_headers: Vec<BlobHeader>,
    pub blob_metadata: Vec<BlobMetadata>,
    pub encoded_blobs: Vec<EncodedBlob>,
    pub merkle_tree: Arc<MerkleTree>,
    pub state: Arc<IndexedOperatorState>,
}

/// Maintains the encode pipeline: scans the blob store for `Processing`
/// blobs, fans encoding jobs out over a bounded worker pool, folds results
/// into the in-memory encoded store, and snapshots `PendingDispersal`
/// results into immutable batches.
pub struct EncodingStreamer<S, C> {
    config: StreamerConfig,
    blob_store: Arc<S>,
    chain_state: Arc<C>,
    encoder: Arc<dyn Encoder>,
    assignment_coordinator: Arc<dyn AssignmentCoordinator>,
    pool: Arc<Semaphore>,
    pub encoded_store: Mutex<EncodedBlobStore>,
    pub notifier: EncodedSizeNotifier,
    reference_block_number: AtomicU32,
}

impl<S, C> EncodingStreamer<S, C>
where
    S: BlobStore,
    C: IndexedChainState + 'static,
{
    pub fn new(
        config: StreamerConfig,
        blob_store: Arc<S>,
        chain_state: Arc<C>,
        encoder: Arc<dyn Encoder>,
        assignment_coordinator: Arc<dyn AssignmentCoordinator>,
        notifier: EncodedSizeNotifier,
    ) -> Self {
        let pool = Arc::new(Semaphore::new(config.num_connections));
        Self {
            config,
            blob_store,
            chain_state,
            encoder,
            assignment_coordinator,
            pool,
            encoded_store: Mutex::new(EncodedBlobStore::new()),
            notifier,
            reference_block_number: AtomicU32::new(0),
        }
    }

    /// Drive the encode pipeline until shutdown: periodic scans plus folding
    /// worker results as they arrive.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let (out, mut results) = mpsc::channel(self.config.encoding_queue_limit.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.encoding_request_interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.request_encoding(&out).await {
                            error!(err = %e, "failed to request encodings");
                        }
                    }
                    Some(outcome) = results.recv() => {
                        if let Err(e) = self.process_encoded_blobs(outcome).await {
                            error!(err = %e, "failed to process encoding result");
                        }
                    }
                }
            }
        });
    }

    /// Scan for `Processing` blobs not yet represented in the encoded store
    /// and submit encoding jobs for each missing `(blob, quorum)` pair.
    pub async fn request_encoding(
        &self,
        out: &mpsc::Sender<EncodingOutcome>,
    ) -> Result<(), StreamerError> {
        let block_number = tokio::time::timeout(
            self.config.chain_read_timeout,
            self.chain_state.get_current_block_number(),
        )
        .await
        .map_err(|_| StreamerError::ChainState("current block query timed out".to_string()))?
        .map_err(|e| StreamerError::ChainState(e.to_string()))?;
        self.reference_block_number
            .store(block_number, Ordering::Release);

        let (metadatas, _) = self
            .blob_store
            .get_blob_metadata_by_status_with_pagination(
                tessera_core::blob::BlobStatus::Processing,
                self.config.max_blobs_to_fetch_from_store,
                None,
            )
            .await?;

        for metadata in metadatas {
            for param in metadata.request_metadata.security_params.clone() {
                let key = metadata.blob_key;
                {
                    let mut store = self.encoded_store.lock().expect("encoded store poisoned");
                    if store.has_encoding_requested_or_stored(key, param.quorum_id) {
                        continue;
                    }
                    if store.num_requested() >= self.config.encoding_queue_limit {
                        warn!("encoding queue limit reached, deferring remaining blobs");
                        return Ok(());
                    }
                    store.put_encoding_request(key, param.quorum_id);
                }
                self.spawn_encoding_job(metadata.clone(), param, block_number, out.clone());
            }
        }
        Ok(())
    }

    fn spawn_encoding_job(
        &self,
        metadata: BlobMetadata,
        param: tessera_core::blob::SecurityParam,
        block_number: u32,
        out: mpsc::Sender<EncodingOutcome>,
    ) {
        let blob_store = Arc::clone(&self.blob_store);
        let chain_state = Arc::clone(&self.chain_state);
        let encoder = Arc::clone(&self.encoder);
        let coordinator = Arc::clone(&self.assignment_coordinator);
        let pool = Arc::clone(&self.pool);
        let target_num_chunks = self.config.target_num_chunks;
        let encoding_timeout = self.config.encoding_timeout;

        tokio::spawn(async move {
            let _permit = pool.acquire().await.expect("pool semaphore closed");
            let key = metadata.blob_key;
            let quorum_id = param.quorum_id;

            let gathered = tokio::time::timeout(encoding_timeout, async {
                let data = blob_store.get_blob_content(&key).await?;
                let state = chain_state
                    .get_operator_state(block_number, &[quorum_id])
                    .await
                    .map_err(|e| StreamerError::ChainState(e.to_string()))?;
                Ok::<_, StreamerError>((data, state))
            })
            .await;

            let result = match gathered {
                Err(_) => Err("encoding job timed out".to_string()),
                Ok(Err(e)) => Err(e.to_string()),
                Ok(Ok((data, state))) => {
                    let blob_length = num_field_elements(data.len()) as u32;
                    coordinator
                        .calculate_chunk_length(&state, blob_length, target_num_chunks, &param)
                        .map_err(|e| e.to_string())
                        .and_then(|chunk_length| {
                            let quorum_info = BlobQuorumInfo {
                                security_param: param,
                                quantization_factor: QUANTIZATION_FACTOR,
                                chunk_length,
                            };
                            let (assignments, info) = coordinator
                                .get_assignments(&state, blob_length, &quorum_info)
                                .map_err(|e| e.to_string())?;
                            let params =
                                EncodingParams::new(chunk_length, info.total_chunks)
                                    .map_err(|e| e.to_string())?;
                            let (commitments, chunks) = encoder
                                .encode(&data, params)
                                .map_err(|e| e.to_string())?;
                            Ok(EncodingResult {
                                metadata: metadata.clone(),
                                reference_block_number: block_number,
                                quorum_info,
                                commitments,
                                chunks,
                                assignments,
                                status: EncodedResultStatus::PendingDispersal,
                            })
                        })
                }
            };

            let outcome = match result {
                Ok(result) => EncodingOutcome::Encoded(Box::new(result)),
                Err(error) => EncodingOutcome::Failed {
                    metadata,
                    quorum_id,
                    error,
                },
            };
            if out.send(outcome).await.is_err() {
                debug!("encoding result dropped, streamer is shutting down");
            }
        });
    }

    /// Fold one worker result into the encoded store.
    pub async fn process_encoded_blobs(
        &self,
        outcome: EncodingOutcome,
    ) -> Result<(), StreamerError> {
        match outcome {
            EncodingOutcome::Encoded(result) => {
                let total = {
                    let mut store = self.encoded_store.lock().expect("encoded store poisoned");
                    store.put_encoding_result(*result);
                    store.encoded_result_size().1
                };
                self.notifier.update(total);
                Ok(())
            }
            EncodingOutcome::Failed {
                metadata,
                quorum_id,
                error,
            } => {
                warn!(
                    blob = %metadata.blob_key,
                    quorum_id,
                    error,
                    "encoding failed, reverting blob for retry"
                );
                self.encoded_store
                    .lock()
                    .expect("encoded store poisoned")
                    .delete_encoding_request(metadata.blob_key, quorum_id);
                self.blob_store
                    .handle_blob_failure(&metadata, self.config.max_num_retries_per_blob)
                    .await?;
                Ok(())
            }
        }
    }

    /// Snapshot the current `PendingDispersal` results into an immutable
    /// batch pinned to the latest observed reference block. Results encoded
    /// against an older block whose operator set has since changed are
    /// discarded for re-encoding.
    pub async fn create_batch(&self) -> Result<Batch, BatchError> {
        let pending: Vec<EncodingResult> = {
            let store = self.encoded_store.lock().expect("encoded store poisoned");
            store.pending_dispersal().cloned().collect()
        };
        if pending.is_empty() {
            return Err(BatchError::NoEncodedResults);
        }

        let reference_block_number = self.reference_block_number.load(Ordering::Acquire);
        let mut quorums: Vec<QuorumId> = pending
            .iter()
            .map(|result| result.quorum_info.quorum_id())
            .collect();
        quorums.sort_unstable();
        quorums.dedup();

        let state = tokio::time::timeout(
            self.config.chain_read_timeout,
            self.chain_state
                .get_indexed_operator_state(reference_block_number, &quorums),
        )
        .await
        .map_err(|_| BatchError::ChainState("operator state query timed out".to_string()))?
        .map_err(|e| BatchError::ChainState(e.to_string()))?;

        // Drop results whose assignments no longer hold at the pinned block.
        let mut fresh = Vec::with_capacity(pending.len());
        for result in pending {
            if result.reference_block_number == reference_block_number {
                fresh.push(result);
                continue;
            }
            let blob_length = num_field_elements(
                result.metadata.request_metadata.blob_size as usize,
            ) as u32;
            let recomputed = self.assignment_coordinator.get_assignments(
                &state.state,
                blob_length,
                &result.quorum_info,
            );
            match recomputed {
                Ok((assignments, _)) if assignments == result.assignments => fresh.push(result),
                _ => {
                    debug!(
                        blob = %result.metadata.blob_key,
                        quorum_id = result.quorum_info.quorum_id(),
                        "operator set changed since encoding, discarding stale result"
                    );
                    self.encoded_store
                        .lock()
                        .expect("encoded store poisoned")
                        .delete_encoding_result(
                            result.metadata.blob_key,
                            result.quorum_info.quorum_id(),
                        );
                }
            }
        }
        if fresh.is_empty() {
            return Err(BatchError::NoEncodedResults);
        }

        // Group per blob; a blob enters the batch only once every quorum it
        // requested has an encoding.
        let mut by_blob: BTreeMap<BlobKey, Vec<EncodingResult>> = BTreeMap::new();
        for result in fresh {
            by_blob
                .entry(result.metadata.blob_key)
                .or_default()
                .push(result);
        }
        let mut complete: Vec<Vec<EncodingResult>> = by_blob
            .into_values()
            .filter(|results| {
                let requested = &results[0].metadata.request_metadata.security_params;
                requested.iter().all(|param| {
                    results
                        .iter()
                        .any(|result| result.quorum_info.quorum_id() == param.quorum_id)
                })
            })
            .collect();
        if complete.is_empty() {
            return Err(BatchError::NoEncodedResults);
        }
        // Dispersal order: stable across parties and runs.
        complete.sort_by_key(|results| {
            (
                results[0].metadata.request_metadata.requested_at,
                results[0].metadata.blob_key,
            )
        });

        let mut blob_headers = Vec::with_capacity(complete.len());
        let mut blob_metadata = Vec::with_capacity(complete.len());
        let mut encoded_blobs = Vec::with_capacity(complete.len());
        for results in &complete {
            let quorum_infos: Vec<BlobQuorumInfo> =
                results.iter().map(|result| result.quorum_info).collect();
            let blob_header = BlobHeader {
                commitments: results[0].commitments.clone(),
                quorum_infos,
            };

            let mut bundles: BTreeMap<_, Bundles> = BTreeMap::new();
            for result in results {
                for (operator, assignment) in &result.assignments {
                    let chunks = assignment
                        .indices()
                        .map(|index| result.chunks[index as usize].clone())
                        .collect();
                    bundles
                        .entry(*operator)
                        .or_default()
                        .insert(result.quorum_info.quorum_id(), chunks);
                }
            }
            encoded_blobs.push(EncodedBlob {
                blob_header: blob_header.clone(),
                bundles,
            });
            blob_headers.push(blob_header);
            blob_metadata.push(results[0].metadata.clone());
        }

        let leaves: Vec<[u8; 32]> = blob_headers
            .iter()
            .map(|header| header.blob_header_hash().0)
            .collect();
        let merkle_tree = MerkleTree::build(&leaves)?;
        let batch_header = BatchHeader {
            batch_root: merkle_tree.root(),
            reference_block_number,
        };

        self.notifier.reset();
        info!(
            num_blobs = blob_headers.len(),
            reference_block_number, "created batch"
        );
        Ok(Batch {
            batch_header,
            blob_headers,
            blob_metadata,
            encoded_blobs,
            merkle_tree: Arc::new(merkle_tree),
            state,
        })
    }

    /// Mark every encoded result of the blob as included in a submitted
    /// batch, so it is neither re-encoded nor re-dispersed while the
    /// confirmation is pending.
    pub fn mark_blob_pending_confirmation(&self, metadata: &BlobMetadata) {
        self.encoded_store
            .lock()
            .expect("encoded store poisoned")
            .mark_pending_confirmation(metadata.blob_key);
    }

    /// Evict all chunks for the blob across all quorums.
    pub fn remove_encoded_blob(&self, metadata: &BlobMetadata) {
        self.encoded_store
            .lock()
            .expect("encoded store poisoned")
            .delete_encoding_results(metadata.blob_key);
    }

    #[must_use]
    pub fn reference_block_number(&self) -> u32 {
        self.reference_block_number.load(Ordering::Acquire)
    }

    /// Test hook mirroring manual reference block control.
    pub fn set_reference_block_number(&self, block_number: u32) {
        self.reference_block_number
            .store(block_number, Ordering::Release);
    }
}
