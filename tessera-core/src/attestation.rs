use std::collections::BTreeMap;

use alloy_primitives::{keccak256, B256};
use ark_bn254::{Bn254, Fq, Fr, G1Affine, G1Projective, G2Affine, G2Projective};
use ark_ec::{pairing::Pairing, AffineRepr as _, CurveGroup as _};
use ark_ff::{PrimeField as _, UniformRand as _};
use ark_serialize::CanonicalSerialize as _;
use ark_std::rand::RngCore;
use num_traits::Zero as _;

use crate::operators::QuorumId;

pub type PublicKeyG1 = G1Affine;
pub type PublicKeyG2 = G2Affine;

/// A BLS signature over BN254 with signatures in G1 and public keys in G2
/// (the G1 copy of each key exists so verifiers can subtract non-signers
/// from a quorum's aggregate with cheap G1 arithmetic).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature(pub G1Affine);

#[derive(Clone, Debug)]
pub struct KeyPair {
    secret: Fr,
    pub pubkey_g1: PublicKeyG1,
    pub pubkey_g2: PublicKeyG2,
}

impl KeyPair {
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let secret = Fr::rand(rng);
        Self {
            pubkey_g1: (G1Affine::generator() * secret).into_affine(),
            pubkey_g2: (G2Affine::generator() * secret).into_affine(),
            secret,
        }
    }

    #[must_use]
    pub fn sign(&self, message: B256) -> Signature {
        Signature((hash_to_g1(message) * self.secret).into_affine())
    }
}

/// Map a 32 byte message onto G1 by keccak hashing with a counter until the
/// digest is the x coordinate of a curve point. BN254's G1 cofactor is one,
/// so every curve point is in the prime order subgroup.
#[must_use]
pub fn hash_to_g1(message: B256) -> G1Affine {
    let mut counter = 0u32;
    loop {
        let mut input = [0u8; 36];
        input[..32].copy_from_slice(message.as_slice());
        input[32..].copy_from_slice(&counter.to_be_bytes());
        let x = Fq::from_be_bytes_mod_order(keccak256(input).as_slice());
        if let Some(point) = G1Affine::get_point_from_x_unchecked(x, false) {
            return point;
        }
        counter += 1;
    }
}

/// `e(sig, g_2) == e(H(m), pubkey)`.
#[must_use]
pub fn verify_signature(signature: &Signature, message: B256, pubkey_g2: &PublicKeyG2) -> bool {
    let lhs = Bn254::pairing(signature.0, G2Affine::generator());
    let rhs = Bn254::pairing(hash_to_g1(message), *pubkey_g2);
    lhs == rhs
}

#[must_use]
pub fn aggregate_signatures<'a>(signatures: impl IntoIterator<Item = &'a Signature>) -> Signature {
    let sum = signatures
        .into_iter()
        .fold(G1Projective::zero(), |acc, sig| acc + sig.0);
    Signature(sum.into_affine())
}

#[must_use]
pub fn aggregate_pubkeys_g1<'a>(keys: impl IntoIterator<Item = &'a PublicKeyG1>) -> PublicKeyG1 {
    keys.into_iter()
        .fold(G1Projective::zero(), |acc, key| acc + key)
        .into_affine()
}

#[must_use]
pub fn aggregate_pubkeys_g2<'a>(keys: impl IntoIterator<Item = &'a PublicKeyG2>) -> PublicKeyG2 {
    keys.into_iter()
        .fold(G2Projective::zero(), |acc, key| acc + key)
        .into_affine()
}

/// Stake-weighted outcome of signature collection for one quorum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct QuorumResult {
    pub quorum_id: QuorumId,
    /// `floor(100 * signer stake / total stake)`.
    pub percent_signed: u8,
}

/// The attestation the batcher anchors on chain.
#[derive(Clone, Debug)]
pub struct SignatureAggregation {
    /// G1 public keys of operators that did not produce a valid signature,
    /// in canonical (sorted) order.
    pub non_signers: Vec<PublicKeyG1>,
    pub quorum_results: BTreeMap<QuorumId, QuorumResult>,
    pub agg_signature: Signature,
    pub agg_pubkey_g2: PublicKeyG2,
}

/// `keccak256(reference_block ∥ sorted non-signer pubkeys)`, the digest the
/// chain stores so verifiers can reconstruct who abstained.
#[must_use]
pub fn compute_signatory_record_hash(
    reference_block_number: u32,
    non_signers: &[PublicKeyG1],
) -> B256 {
    let mut serialized: Vec<Vec<u8>> = non_signers
        .iter()
        .map(|key| {
            let mut bytes = Vec::new();
            key.serialize_compressed(&mut bytes)
                .expect("serialization into a vec cannot fail");
            bytes
        })
        .collect();
    serialized.sort_unstable();
    let mut input = reference_block_number.to_be_bytes().to_vec();
    for key in serialized {
        input.extend_from_slice(&key);
    }
    keccak256(&input)
}
