use std::{collections::BTreeMap, fmt};

use alloy_primitives::{keccak256, B256};
use ark_serialize::CanonicalSerialize as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    attestation::QuorumResult,
    operators::QuorumId,
};
use tessera_kzgrs::{Commitment, FieldElement, G2Commitment, Proof};

/// Fixed at one; the chunk length derivation admits other values but the
/// surrounding protocol does not.
pub const QUANTIZATION_FACTOR: u32 = 1;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("quorum {quorum_id}: quorum threshold {quorum_threshold} must exceed adversary threshold {adversary_threshold}")]
    ThresholdOrder {
        quorum_id: QuorumId,
        adversary_threshold: u8,
        quorum_threshold: u8,
    },
    #[error("quorum {quorum_id}: thresholds must be percentages in 0..=100")]
    ThresholdRange { quorum_id: QuorumId },
    #[error("blob requests no quorums")]
    NoQuorums,
    #[error("quorum {0} requested more than once")]
    DuplicateQuorum(QuorumId),
}

/// Security requirements a blob requests for one quorum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityParam {
    pub quorum_id: QuorumId,
    /// Assumed maximum stake fraction (%) held by adversarial operators.
    pub adversary_threshold: u8,
    /// Stake fraction (%) of signatures required for a valid attestation.
    pub quorum_threshold: u8,
}

impl SecurityParam {
    pub fn validate(&self) -> Result<(), BlobError> {
        if self.quorum_threshold > 100 || self.adversary_threshold > 100 {
            return Err(BlobError::ThresholdRange {
                quorum_id: self.quorum_id,
            });
        }
        if self.quorum_threshold <= self.adversary_threshold {
            return Err(BlobError::ThresholdOrder {
                quorum_id: self.quorum_id,
                adversary_threshold: self.adversary_threshold,
                quorum_threshold: self.quorum_threshold,
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRequestHeader {
    pub security_params: Vec<SecurityParam>,
}

impl BlobRequestHeader {
    pub fn validate(&self) -> Result<(), BlobError> {
        if self.security_params.is_empty() {
            return Err(BlobError::NoQuorums);
        }
        let mut seen = [false; 256];
        for param in &self.security_params {
            param.validate()?;
            if seen[param.quorum_id as usize] {
                return Err(BlobError::DuplicateQuorum(param.quorum_id));
            }
            seen[param.quorum_id as usize] = true;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    pub request_header: BlobRequestHeader,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlobKey {
    pub blob_hash: B256,
    pub nonce: u64,
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}-{}", self.blob_hash, self.nonce)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobStatus {
    Processing,
    Confirmed,
    Failed,
    InsufficientSignatures,
    Finalized,
}

impl BlobStatus {
    /// Whether the status can never transition again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Failed | Self::InsufficientSignatures | Self::Finalized
        )
    }
}

impl fmt::Display for BlobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Processing => "Processing",
            Self::Confirmed => "Confirmed",
            Self::Failed => "Failed",
            Self::InsufficientSignatures => "InsufficientSignatures",
            Self::Finalized => "Finalized",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestMetadata {
    pub blob_size: u64,
    /// Submission time in nanoseconds since the unix epoch.
    pub requested_at: u64,
    pub security_params: Vec<SecurityParam>,
}

#[derive(Clone, Debug)]
pub struct BlobMetadata {
    pub blob_key: BlobKey,
    pub blob_status: BlobStatus,
    pub num_retries: u32,
    pub request_metadata: RequestMetadata,
    pub confirmation_info: Option<ConfirmationInfo>,
}

/// Everything a verifier needs to check a blob against its on-chain batch.
#[derive(Clone, Debug)]
pub struct ConfirmationInfo {
    pub batch_header_hash: B256,
    pub blob_index: u32,
    pub signatory_record_hash: B256,
    pub reference_block_number: u32,
    pub batch_root: B256,
    pub blob_inclusion_proof: Vec<B256>,
    pub blob_commitments: BlobCommitments,
    pub batch_id: u32,
    pub confirmation_txn_hash: B256,
    pub confirmation_block_number: u32,
    /// Reserved for future accounting; always a single zero byte.
    pub fee: Vec<u8>,
    pub quorum_results: BTreeMap<QuorumId, QuorumResult>,
    pub blob_quorum_infos: Vec<BlobQuorumInfo>,
}

/// KZG commitments binding a blob: the G1 commitment operators verify chunks
/// against, and the G2 length commitment + proof attesting the committed
/// polynomial has degree below `length`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobCommitments {
    pub commitment: Commitment,
    pub length_commitment: G2Commitment,
    pub length_proof: G2Commitment,
    /// Blob length in field elements; the exclusive degree bound.
    pub length: u32,
}

/// One coded segment: a coset of evaluations plus its opening proof against
/// the blob commitment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub coeffs: Vec<FieldElement>,
    pub proof: Proof,
}

impl Chunk {
    /// Serialized footprint, used for batch size accounting.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.coeffs.len() * 32 + 64
    }
}

/// Per-quorum dispersal parameters recorded in the blob header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobQuorumInfo {
    pub security_param: SecurityParam,
    pub quantization_factor: u32,
    pub chunk_length: u32,
}

impl BlobQuorumInfo {
    #[must_use]
    pub const fn quorum_id(&self) -> QuorumId {
        self.security_param.quorum_id
    }
}

/// The structure whose hash is the Merkle leaf of the batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobHeader {
    pub commitments: BlobCommitments,
    pub quorum_infos: Vec<BlobQuorumInfo>,
}

impl BlobHeader {
    /// Canonical keccak-256 hash over compressed points and quorum info
    /// fields. Stable across platforms: ark compressed encodings and
    /// big-endian integers only.
    #[must_use]
    pub fn blob_header_hash(&self) -> B256 {
        let mut bytes = Vec::new();
        self.commitments
            .commitment
            .serialize_compressed(&mut bytes)
            .expect("serialization into a vec cannot fail");
        self.commitments
            .length_commitment
            .serialize_compressed(&mut bytes)
            .expect("serialization into a vec cannot fail");
        self.commitments
            .length_proof
            .serialize_compressed(&mut bytes)
            .expect("serialization into a vec cannot fail");
        bytes.extend_from_slice(&self.commitments.length.to_be_bytes());
        for info in &self.quorum_infos {
            bytes.push(info.security_param.quorum_id);
            bytes.push(info.security_param.adversary_threshold);
            bytes.push(info.security_param.quorum_threshold);
            bytes.extend_from_slice(&info.quantization_factor.to_be_bytes());
            bytes.extend_from_slice(&info.chunk_length.to_be_bytes());
        }
        keccak256(&bytes)
    }
}
