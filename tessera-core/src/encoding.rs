use thiserror::Error;

use crate::blob::{BlobCommitments, Chunk};
use tessera_kzgrs::{EncodingParams, KzgRsError};

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error(transparent)]
    Kzg(#[from] KzgRsError),
    #[error("chunk at index {index} failed verification against the blob commitment")]
    InvalidChunkProof { index: u32 },
    #[error("length proof does not attest the claimed blob length")]
    InvalidLengthProof,
    #[error("batched chunk verification failed across {num_blobs} blobs")]
    InvalidSubBatch { num_blobs: usize },
    #[error("mismatched chunk and index counts")]
    ChunkIndexMismatch,
}

/// One chunk staged for batched verification, tagged with the blob it came
/// from and its index within the encoding.
#[derive(Clone, Copy, Debug)]
pub struct Sample<'a> {
    pub blob_index: usize,
    pub commitments: &'a BlobCommitments,
    pub chunk: &'a Chunk,
    pub assignment_index: u32,
}

/// Erasure coding seam: KZG commit + Reed-Solomon extend on encode, pairing
/// checks on verify, interpolation on decode.
pub trait Encoder: Send + Sync {
    fn encode(
        &self,
        data: &[u8],
        params: EncodingParams,
    ) -> Result<(BlobCommitments, Vec<Chunk>), EncodingError>;

    /// Verify the length proof pairing equation against the length
    /// commitment. Guards against commitments to oversized polynomials.
    fn verify_blob_length(&self, commitments: &BlobCommitments) -> Result<(), EncodingError>;

    fn verify_chunks(
        &self,
        chunks: &[Chunk],
        indices: &[u32],
        commitments: &BlobCommitments,
        params: EncodingParams,
    ) -> Result<(), EncodingError>;

    /// Batched pairing check over many chunks from many blobs; the
    /// throughput path for retrieval.
    fn universal_verify_sub_batch(
        &self,
        params: EncodingParams,
        samples: &[Sample<'_>],
        num_blobs: usize,
    ) -> Result<(), EncodingError>;

    /// Reconstruct the original bytes from any sufficient subset of chunks.
    fn decode(
        &self,
        chunks: &[Chunk],
        indices: &[u32],
        params: EncodingParams,
        max_input_size: usize,
    ) -> Result<Vec<u8>, EncodingError>;
}
