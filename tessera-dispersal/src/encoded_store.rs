use std::collections::{BTreeMap, HashSet};

use thiserror::Error;

use tessera_core::{
    assignment::Assignment,
    blob::{BlobCommitments, BlobKey, BlobMetadata, BlobQuorumInfo, Chunk},
    operators::{OperatorId, QuorumId},
};

#[derive(Debug, Error)]
pub enum EncodedStoreError {
    #[error("no encoding result for blob {key} quorum {quorum_id}")]
    NoSuchKey { key: BlobKey, quorum_id: QuorumId },
}

/// Lifecycle of an encoded result inside the streamer's in-memory store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncodedResultStatus {
    /// Encoded and waiting to be picked into a batch.
    PendingDispersal,
    /// Included in a submitted batch; waiting for the confirmation receipt.
    PendingConfirmation,
}

/// One blob encoded for one quorum.
#[derive(Clone, Debug)]
pub struct EncodingResult {
    pub metadata: BlobMetadata,
    pub reference_block_number: u32,
    pub quorum_info: BlobQuorumInfo,
    pub commitments: BlobCommitments,
    pub chunks: Vec<Chunk>,
    pub assignments: BTreeMap<OperatorId, Assignment>,
    pub status: EncodedResultStatus,
}

impl EncodingResult {
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .map(|chunk| chunk.size_bytes() as u64)
            .sum()
    }
}

/// In-memory index of encoded results keyed by `(blob, quorum)`, owned by
/// the encoding streamer. Tracks in-flight encode requests so the same pair
/// is never encoded twice concurrently, and the total encoded size for the
/// batch size trigger.
#[derive(Default)]
pub struct EncodedBlobStore {
    results: BTreeMap<(BlobKey, QuorumId), EncodingResult>,
    requested: HashSet<(BlobKey, QuorumId)>,
    total_size: u64,
}

impl EncodedBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an encode for this pair is in flight or already stored.
    #[must_use]
    pub fn has_encoding_requested_or_stored(&self, key: BlobKey, quorum_id: QuorumId) -> bool {
        self.requested.contains(&(key, quorum_id)) || self.results.contains_key(&(key, quorum_id))
    }

    pub fn put_encoding_request(&mut self, key: BlobKey, quorum_id: QuorumId) {
        self.requested.insert((key, quorum_id));
    }

    pub fn delete_encoding_request(&mut self, key: BlobKey, quorum_id: QuorumId) {
        self.requested.remove(&(key, quorum_id));
    }

    #[must_use]
    pub fn num_requested(&self) -> usize {
        self.requested.len()
    }

    pub fn put_encoding_result(&mut self, result: EncodingResult) {
        let key = (result.metadata.blob_key, result.quorum_info.quorum_id());
        self.requested.remove(&key);
        self.total_size += result.size_bytes();
        if let Some(previous) = self.results.insert(key, result) {
            self.total_size -= previous.size_bytes();
        }
    }

    pub fn get_encoding_result(
        &self,
        key: BlobKey,
        quorum_id: QuorumId,
    ) -> Result<&EncodingResult, EncodedStoreError> {
        self.results
            .get(&(key, quorum_id))
            .ok_or(EncodedStoreError::NoSuchKey { key, quorum_id })
    }

    /// All results currently awaiting dispersal.
    pub fn pending_dispersal(&self) -> impl Iterator<Item = &EncodingResult> {
        self.results
            .values()
            .filter(|result| result.status == EncodedResultStatus::PendingDispersal)
    }

    pub fn mark_pending_confirmation(&mut self, key: BlobKey) {
        for ((blob_key, _), result) in self.results.iter_mut() {
            if *blob_key == key {
                result.status = EncodedResultStatus::PendingConfirmation;
            }
        }
    }

    /// Evict every quorum's result for the blob.
    pub fn delete_encoding_results(&mut self, key: BlobKey) {
        let quorums: Vec<QuorumId> = self
            .results
            .keys()
            .filter(|(blob_key, _)| *blob_key == key)
            .map(|(_, quorum_id)| *quorum_id)
            .collect();
        for quorum_id in quorums {
            if let Some(removed) = self.results.remove(&(key, quorum_id)) {
                self.total_size -= removed.size_bytes();
            }
        }
    }

    pub fn delete_encoding_result(&mut self, key: BlobKey, quorum_id: QuorumId) {
        if let Some(removed) = self.results.remove(&(key, quorum_id)) {
            self.total_size -= removed.size_bytes();
        }
    }

    /// Count and total serialized size of stored results.
    #[must_use]
    pub fn encoded_result_size(&self) -> (usize, u64) {
        (self.results.len(), self.total_size)
    }
}
