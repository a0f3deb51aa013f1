use std::{collections::BTreeMap, sync::Arc};

use alloy_primitives::B256;
use async_trait::async_trait;
use futures::{stream::FuturesUnordered, StreamExt as _};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use tessera_core::{
    assignment::{Assignment, AssignmentCoordinator},
    blob::{BlobHeader, BlobQuorumInfo, Chunk},
    encoding::{Encoder, Sample},
    merkle::MerkleTree,
    operators::{IndexedChainState, OperatorId, QuorumId},
    DynError,
};
use tessera_kzgrs::{EncodingParams, BYTES_PER_FIELD_ELEMENT};

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("chain state unavailable: {0}")]
    ChainState(String),
    #[error("failed to get blob header from all operators")]
    BlobHeaderUnavailable,
    #[error("blob was not dispersed on quorum {0}")]
    QuorumNotRequested(QuorumId),
    #[error("blob commitments rejected: {0}")]
    InvalidCommitments(String),
    #[error(transparent)]
    Assignment(#[from] tessera_core::assignment::AssignmentError),
    #[error(transparent)]
    Encoding(#[from] tessera_kzgrs::KzgRsError),
    #[error("insufficient valid chunks to reconstruct: have {got} points, need {needed}")]
    InsufficientChunks { got: usize, needed: usize },
    #[error("decoding failed: {0}")]
    Decode(String),
}

/// On-chain view of a confirmed batch, as stored by the service contract.
#[derive(Clone, Debug)]
pub struct OnChainBatchMetadata {
    pub blob_headers_root: B256,
    pub quorum_numbers: Vec<QuorumId>,
    pub quorum_signed_percentages: Vec<u8>,
    pub reference_block_number: u32,
}

/// Reads confirmed batch metadata from the chain.
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    async fn fetch_batch_header(
        &self,
        batch_header_hash: B256,
    ) -> Result<OnChainBatchMetadata, DynError>;
}

/// Per-operator retrieval transport.
#[async_trait]
pub trait NodeClient: Send + Sync + 'static {
    /// Fetch the blob header the operator holds for `(batch, blob_index)`
    /// along with its Merkle inclusion proof against the batch root.
    async fn get_blob_header(
        &self,
        socket: &str,
        batch_header_hash: B256,
        blob_index: u32,
    ) -> Result<(BlobHeader, Vec<B256>), DynError>;

    /// Fetch the operator's chunk bundle for the blob on one quorum.
    async fn get_chunks(
        &self,
        socket: &str,
        batch_header_hash: B256,
        blob_index: u32,
        quorum_id: QuorumId,
    ) -> Result<Vec<Chunk>, DynError>;
}

/// Reconstructs original blobs from operator-held chunks: the reciprocal of
/// the dispersal pipeline. Every received chunk is verified against the
/// on-chain blob commitment before it is allowed into the decoder.
pub struct RetrievalClient<CS, N> {
    chain_state: Arc<CS>,
    assignment_coordinator: Arc<dyn AssignmentCoordinator>,
    node_client: Arc<N>,
    encoder: Arc<dyn Encoder>,
    num_connections: usize,
}

impl<CS, N> RetrievalClient<CS, N>
where
    CS: IndexedChainState + 'static,
    N: NodeClient,
{
    pub fn new(
        chain_state: Arc<CS>,
        assignment_coordinator: Arc<dyn AssignmentCoordinator>,
        node_client: Arc<N>,
        encoder: Arc<dyn Encoder>,
        num_connections: usize,
    ) -> Self {
        Self {
            chain_state,
            assignment_coordinator,
            node_client,
            encoder,
            num_connections: num_connections.max(1),
        }
    }

    /// Resolve the batch through the chain first, then retrieve: the entry
    /// point for callers that only hold a batch header hash.
    pub async fn retrieve_blob_from_chain<C: ChainClient>(
        &self,
        chain_client: &C,
        batch_header_hash: B256,
        blob_index: u32,
        quorum_id: QuorumId,
    ) -> Result<Vec<u8>, RetrievalError> {
        let batch = chain_client
            .fetch_batch_header(batch_header_hash)
            .await
            .map_err(|e| RetrievalError::ChainState(e.to_string()))?;
        self.retrieve_blob(
            batch_header_hash,
            blob_index,
            batch.reference_block_number,
            batch.blob_headers_root,
            quorum_id,
        )
        .await
    }

    /// Fetch, verify, and decode one blob from the operators of `quorum_id`.
    pub async fn retrieve_blob(
        &self,
        batch_header_hash: B256,
        blob_index: u32,
        reference_block_number: u32,
        batch_root: B256,
        quorum_id: QuorumId,
    ) -> Result<Vec<u8>, RetrievalError> {
        let state = self
            .chain_state
            .get_indexed_operator_state(reference_block_number, &[quorum_id])
            .await
            .map_err(|e| RetrievalError::ChainState(e.to_string()))?;

        // Any single honest operator suffices for the header; the Merkle
        // proof against the on-chain batch root keeps them honest.
        let mut blob_header = None;
        for (operator, info) in &state.indexed_operators {
            match self
                .node_client
                .get_blob_header(&info.socket, batch_header_hash, blob_index)
                .await
            {
                Ok((header, proof)) => {
                    let leaf = header.blob_header_hash();
                    if MerkleTree::verify_proof(
                        batch_root,
                        leaf.as_slice(),
                        &proof,
                        blob_index as usize,
                    ) {
                        blob_header = Some(header);
                        break;
                    }
                    warn!(
                        operator = %hex(operator),
                        "blob header inclusion proof failed verification"
                    );
                }
                Err(err) => {
                    debug!(operator = %hex(operator), err = %err, "failed to get blob header");
                }
            }
        }
        let blob_header = blob_header.ok_or(RetrievalError::BlobHeaderUnavailable)?;

        let quorum_info: BlobQuorumInfo = *blob_header
            .quorum_infos
            .iter()
            .find(|info| info.quorum_id() == quorum_id)
            .ok_or(RetrievalError::QuorumNotRequested(quorum_id))?;
        self.encoder
            .verify_blob_length(&blob_header.commitments)
            .map_err(|e| RetrievalError::InvalidCommitments(e.to_string()))?;

        // Recompute what the disperser computed; assignments are
        // deterministic so no coordination is needed.
        let blob_length = blob_header.commitments.length;
        self.assignment_coordinator
            .validate_chunk_length(blob_length, &quorum_info)?;
        let (assignments, assignment_info) = self.assignment_coordinator.get_assignments(
            &state.state,
            blob_length,
            &quorum_info,
        )?;
        let params = EncodingParams::new(quorum_info.chunk_length, assignment_info.total_chunks)?;

        let needed_points = blob_length as usize;
        let (chunks, indices) = self
            .fetch_and_verify_chunks(
                batch_header_hash,
                blob_index,
                quorum_id,
                &state,
                &blob_header,
                &assignments,
                params,
                needed_points,
            )
            .await;

        let got_points = chunks.len() * quorum_info.chunk_length as usize;
        if got_points < needed_points {
            return Err(RetrievalError::InsufficientChunks {
                got: got_points,
                needed: needed_points,
            });
        }

        self.encoder
            .decode(
                &chunks,
                &indices,
                params,
                needed_points * BYTES_PER_FIELD_ELEMENT,
            )
            .map_err(|e| RetrievalError::Decode(e.to_string()))
    }

    /// Scatter chunk requests across the quorum and keep only chunks that
    /// pass the batched pairing check. Invalid operators are dropped
    /// silently; collection stops as soon as enough points accumulated.
    #[allow(clippy::too_many_arguments)]
    async fn fetch_and_verify_chunks(
        &self,
        batch_header_hash: B256,
        blob_index: u32,
        quorum_id: QuorumId,
        state: &tessera_core::operators::IndexedOperatorState,
        blob_header: &BlobHeader,
        assignments: &BTreeMap<OperatorId, Assignment>,
        params: EncodingParams,
        needed_points: usize,
    ) -> (Vec<Chunk>, Vec<u32>) {
        let pool = Arc::new(Semaphore::new(self.num_connections));
        let mut requests = FuturesUnordered::new();
        for (operator, assignment) in assignments {
            let Some(info) = state.indexed_operators.get(operator) else {
                continue;
            };
            let node_client = Arc::clone(&self.node_client);
            let socket = info.socket.clone();
            let operator = *operator;
            let assignment = *assignment;
            let pool = Arc::clone(&pool);
            requests.push(async move {
                let _permit = pool.acquire().await.expect("retrieval pool closed");
                let chunks = node_client
                    .get_chunks(&socket, batch_header_hash, blob_index, quorum_id)
                    .await;
                (operator, assignment, chunks)
            });
        }

        let chunk_length = params.chunk_length as usize;
        let mut chunks = Vec::new();
        let mut indices = Vec::new();
        while let Some((operator, assignment, fetched)) = requests.next().await {
            let fetched = match fetched {
                Ok(fetched) => fetched,
                Err(err) => {
                    debug!(operator = %hex(&operator), err = %err, "failed to get chunks");
                    continue;
                }
            };
            if fetched.len() != assignment.num_chunks as usize {
                warn!(
                    operator = %hex(&operator),
                    got = fetched.len(),
                    expected = assignment.num_chunks,
                    "operator returned a bundle of the wrong size"
                );
                continue;
            }

            let samples: Vec<Sample<'_>> = fetched
                .iter()
                .enumerate()
                .map(|(offset, chunk)| Sample {
                    blob_index: 0,
                    commitments: &blob_header.commitments,
                    chunk,
                    assignment_index: assignment.start_index + offset as u32,
                })
                .collect();
            if let Err(err) = self.encoder.universal_verify_sub_batch(params, &samples, 1) {
                warn!(operator = %hex(&operator), err = %err, "operator returned invalid chunks");
                continue;
            }

            for (offset, chunk) in fetched.into_iter().enumerate() {
                indices.push(assignment.start_index + offset as u32);
                chunks.push(chunk);
            }
            if chunks.len() * chunk_length >= needed_points {
                break;
            }
        }
        (chunks, indices)
    }
}

fn hex(operator: &OperatorId) -> String {
    alloy_primitives::hex::encode(operator)
}
