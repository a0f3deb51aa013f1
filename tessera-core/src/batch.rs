use alloy_primitives::{keccak256, B256};
use serde::{Deserialize, Serialize};

/// Header anchoring one batch: the Merkle root over the blob header hashes
/// in dispersal order, and the block at which the operator set was pinned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHeader {
    pub batch_root: B256,
    pub reference_block_number: u32,
}

impl BatchHeader {
    /// `keccak256(batch_root ∥ be(reference_block_number))`.
    #[must_use]
    pub fn batch_header_hash(&self) -> B256 {
        let mut bytes = [0u8; 36];
        bytes[..32].copy_from_slice(self.batch_root.as_slice());
        bytes[32..].copy_from_slice(&self.reference_block_number.to_be_bytes());
        keccak256(bytes)
    }
}
