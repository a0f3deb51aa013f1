use alloy_primitives::{keccak256, B256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MerkleError {
    #[error("cannot build a tree with no leaves")]
    NoLeaves,
    #[error("leaf index {index} out of range for {num_leaves} leaves")]
    IndexOutOfRange { index: usize, num_leaves: usize },
}

/// Keccak-256 binary Merkle tree. Leaves are hashed once on insertion; odd
/// levels are padded by duplicating the last node.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    layers: Vec<Vec<B256>>,
}

impl MerkleTree {
    pub fn build<L: AsRef<[u8]>>(leaves: &[L]) -> Result<Self, MerkleError> {
        if leaves.is_empty() {
            return Err(MerkleError::NoLeaves);
        }
        let mut layers = vec![leaves
            .iter()
            .map(|leaf| keccak256(leaf.as_ref()))
            .collect::<Vec<_>>()];
        while layers.last().map(Vec::len) != Some(1) {
            let previous = layers.last().expect("at least one layer");
            let next = previous
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => hash_pair(left, right),
                    [odd] => hash_pair(odd, odd),
                    _ => unreachable!("chunks of two"),
                })
                .collect();
            layers.push(next);
        }
        Ok(Self { layers })
    }

    #[must_use]
    pub fn root(&self) -> B256 {
        self.layers.last().expect("tree is never empty")[0]
    }

    #[must_use]
    pub fn num_leaves(&self) -> usize {
        self.layers[0].len()
    }

    /// Sibling path from leaf `index` up to (excluding) the root.
    pub fn proof(&self, index: usize) -> Result<Vec<B256>, MerkleError> {
        if index >= self.num_leaves() {
            return Err(MerkleError::IndexOutOfRange {
                index,
                num_leaves: self.num_leaves(),
            });
        }
        let mut path = Vec::with_capacity(self.layers.len() - 1);
        let mut position = index;
        for layer in &self.layers[..self.layers.len() - 1] {
            let sibling = position ^ 1;
            path.push(if sibling < layer.len() {
                layer[sibling]
            } else {
                layer[position]
            });
            position >>= 1;
        }
        Ok(path)
    }

    /// Check an inclusion path produced by [`Self::proof`] against a root.
    #[must_use]
    pub fn verify_proof(root: B256, leaf: &[u8], proof: &[B256], index: usize) -> bool {
        let mut hash = keccak256(leaf);
        let mut position = index;
        for sibling in proof {
            hash = if position & 1 == 1 {
                hash_pair(sibling, &hash)
            } else {
                hash_pair(&hash, sibling)
            };
            position >>= 1;
        }
        hash == root
    }
}

fn hash_pair(left: &B256, right: &B256) -> B256 {
    let mut bytes = [0u8; 64];
    bytes[..32].copy_from_slice(left.as_slice());
    bytes[32..].copy_from_slice(right.as_slice());
    keccak256(bytes)
}
