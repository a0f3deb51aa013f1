pub mod assignment;
pub mod attestation;
pub mod batch;
pub mod blob;
pub mod encoding;
pub mod merkle;
pub mod operators;

pub use assignment::{Assignment, AssignmentCoordinator, AssignmentInfo, StdAssignmentCoordinator};
pub use attestation::{KeyPair, QuorumResult, Signature, SignatureAggregation};
pub use batch::BatchHeader;
pub use blob::{
    Blob, BlobCommitments, BlobHeader, BlobKey, BlobMetadata, BlobQuorumInfo, BlobStatus, Chunk,
    SecurityParam,
};
pub use encoding::{Encoder, EncodingError, Sample};
pub use operators::{
    ChainState, IndexedChainState, IndexedOperatorState, OperatorId, OperatorState, QuorumId,
};

pub type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;
