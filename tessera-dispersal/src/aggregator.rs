use std::{collections::BTreeMap, time::Duration};

use alloy_primitives::{B256, U256};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tessera_core::{
    attestation::{
        aggregate_pubkeys_g2, aggregate_signatures, verify_signature, QuorumResult, Signature,
        SignatureAggregation,
    },
    operators::{IndexedOperatorState, OperatorId, QuorumId},
};

use crate::dispatcher::SigningReply;

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("no signatures received before the attestation deadline")]
    NoSignatures,
    #[error("no quorum reached its threshold")]
    NoQuorumReachedThreshold,
    #[error("aggregate signature failed verification")]
    InvalidAggregateSignature,
}

/// Collects operator signatures from the dispatcher's reply stream and
/// aggregates them per quorum.
#[derive(Clone, Copy, Debug, Default)]
pub struct SignatureAggregator;

impl SignatureAggregator {
    /// Consume replies until all operators answered, every quorum crossed
    /// its threshold, or the attestation timeout elapsed; then aggregate.
    ///
    /// `quorum_thresholds` carries, per quorum, the highest threshold any
    /// blob in the batch demands; crossing all of them ends collection early.
    pub async fn aggregate_signatures(
        &self,
        state: &IndexedOperatorState,
        quorum_thresholds: &BTreeMap<QuorumId, u8>,
        header_hash: B256,
        mut replies: mpsc::Receiver<SigningReply>,
        timeout: Duration,
    ) -> Result<SignatureAggregation, AggregationError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let total_operators = state.indexed_operators.len();
        let mut signers: BTreeMap<OperatorId, Signature> = BTreeMap::new();
        let mut replied = 0usize;

        while replied < total_operators {
            let reply = tokio::select! {
                reply = replies.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
                () = tokio::time::sleep_until(deadline) => {
                    warn!(
                        replied,
                        total_operators, "attestation timeout elapsed, aggregating what arrived"
                    );
                    break;
                }
            };
            replied += 1;

            let signature = match reply.signature {
                Ok(signature) => signature,
                Err(err) => {
                    warn!(operator = %hex(&reply.operator), err = %err, "operator rejected dispersal");
                    continue;
                }
            };
            let Some(info) = state.indexed_operators.get(&reply.operator) else {
                warn!(operator = %hex(&reply.operator), "reply from operator outside the state");
                continue;
            };
            if !verify_signature(&signature, header_hash, &info.pubkey_g2) {
                warn!(operator = %hex(&reply.operator), "invalid signature over batch header");
                continue;
            }
            signers.insert(reply.operator, signature);

            let all_quorums_full = quorum_thresholds.iter().all(|(quorum_id, threshold)| {
                percent_signed(state, &signers, *quorum_id) >= *threshold
            });
            if all_quorums_full {
                debug!(replied, "every quorum reached its threshold, stopping early");
                break;
            }
        }

        if signers.is_empty() {
            return Err(AggregationError::NoSignatures);
        }

        let quorum_results: BTreeMap<QuorumId, QuorumResult> = quorum_thresholds
            .keys()
            .map(|quorum_id| {
                (
                    *quorum_id,
                    QuorumResult {
                        quorum_id: *quorum_id,
                        percent_signed: percent_signed(state, &signers, *quorum_id),
                    },
                )
            })
            .collect();
        let any_reached = quorum_thresholds
            .iter()
            .any(|(quorum_id, threshold)| quorum_results[quorum_id].percent_signed >= *threshold);
        if !any_reached {
            return Err(AggregationError::NoQuorumReachedThreshold);
        }

        let non_signers: Vec<_> = state
            .indexed_operators
            .iter()
            .filter(|(operator, _)| !signers.contains_key(*operator))
            .map(|(_, info)| info.pubkey_g1)
            .collect();
        let agg_signature = aggregate_signatures(signers.values());
        let agg_pubkey_g2 = aggregate_pubkeys_g2(
            signers
                .keys()
                .map(|operator| &state.indexed_operators[operator].pubkey_g2),
        );
        if !verify_signature(&agg_signature, header_hash, &agg_pubkey_g2) {
            return Err(AggregationError::InvalidAggregateSignature);
        }

        Ok(SignatureAggregation {
            non_signers,
            quorum_results,
            agg_signature,
            agg_pubkey_g2,
        })
    }
}

/// `floor(100 * signer stake / total stake)` for one quorum.
fn percent_signed(
    state: &IndexedOperatorState,
    signers: &BTreeMap<OperatorId, Signature>,
    quorum_id: QuorumId,
) -> u8 {
    let Some(operators) = state.state.operators.get(&quorum_id) else {
        return 0;
    };
    let Some(total) = state.state.totals.get(&quorum_id) else {
        return 0;
    };
    if total.stake.is_zero() {
        return 0;
    }
    let signed: U256 = operators
        .iter()
        .filter(|(operator, _)| signers.contains_key(*operator))
        .map(|(_, info)| info.stake)
        .fold(U256::ZERO, |acc, stake| acc + stake);
    (signed * U256::from(100u32) / total.stake).saturating_to::<u8>()
}

fn hex(operator: &OperatorId) -> String {
    alloy_primitives::hex::encode(operator)
}
