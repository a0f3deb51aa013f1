use std::{collections::BTreeMap, sync::Arc};

use alloy_primitives::U256;
use async_trait::async_trait;

use crate::{
    attestation::{PublicKeyG1, PublicKeyG2},
    DynError,
};

pub type QuorumId = u8;
pub type OperatorId = [u8; 32];
pub type OperatorIndex = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperatorInfo {
    pub stake: U256,
    pub index: OperatorIndex,
}

/// Stake distribution snapshot at one reference block. Immutable once
/// captured; replaced, never mutated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorState {
    /// Per quorum, the operators registered for it.
    pub operators: BTreeMap<QuorumId, BTreeMap<OperatorId, OperatorInfo>>,
    /// Per quorum, total stake and operator count (in `index`).
    pub totals: BTreeMap<QuorumId, OperatorInfo>,
    pub block_number: u32,
}

#[derive(Clone, Debug)]
pub struct IndexedOperatorInfo {
    pub pubkey_g1: PublicKeyG1,
    pub pubkey_g2: PublicKeyG2,
    /// Network address the operator serves dispersal and retrieval on.
    pub socket: String,
}

/// [`OperatorState`] extended with the keys and sockets needed to talk to
/// and attest against the operator set.
#[derive(Clone, Debug)]
pub struct IndexedOperatorState {
    pub state: OperatorState,
    pub indexed_operators: BTreeMap<OperatorId, IndexedOperatorInfo>,
    /// Per quorum aggregate of all member G1 public keys; verifiers subtract
    /// non-signers from this.
    pub agg_pubkeys_g1: BTreeMap<QuorumId, PublicKeyG1>,
}

#[async_trait]
pub trait ChainState: Send + Sync {
    async fn get_current_block_number(&self) -> Result<u32, DynError>;

    async fn get_operator_state(
        &self,
        block_number: u32,
        quorums: &[QuorumId],
    ) -> Result<OperatorState, DynError>;
}

#[async_trait]
pub trait IndexedChainState: ChainState {
    async fn get_indexed_operator_state(
        &self,
        block_number: u32,
        quorums: &[QuorumId],
    ) -> Result<Arc<IndexedOperatorState>, DynError>;
}
