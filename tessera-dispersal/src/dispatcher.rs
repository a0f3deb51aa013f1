use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::mpsc;

use tessera_core::{
    attestation::Signature,
    batch::BatchHeader,
    blob::{BlobHeader, Chunk},
    operators::{IndexedOperatorState, OperatorId, QuorumId},
    DynError,
};

/// Chunks an operator holds for one blob, one entry per requested quorum.
pub type Bundles = BTreeMap<QuorumId, Vec<Chunk>>;

/// One blob ready for dispersal: its header plus the chunk bundles already
/// trimmed to each operator's assignment.
#[derive(Clone, Debug)]
pub struct EncodedBlob {
    pub blob_header: BlobHeader,
    pub bundles: BTreeMap<OperatorId, Bundles>,
}

/// An operator's response to a store-chunks request: its BLS signature over
/// the batch header hash, or the transport/validation error it failed with.
#[derive(Debug)]
pub struct SigningReply {
    pub operator: OperatorId,
    pub signature: Result<Signature, DynError>,
}

/// Scatter seam to the operator transport. One concurrent send per operator;
/// replies stream back on the returned channel as they arrive.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn disperse_batch(
        &self,
        state: Arc<IndexedOperatorState>,
        blobs: Vec<EncodedBlob>,
        batch_header: BatchHeader,
    ) -> mpsc::Receiver<SigningReply>;
}
