use std::{borrow::Cow, fs::File, io::Write as _, path::Path};

use alloy_primitives::keccak256;
use ark_bn254::{Bn254, Fr, G1Affine, G1Projective, G2Affine, G2Projective};
use ark_ec::{
    pairing::{Pairing, PairingOutput},
    scalar_mul::fixed_base::FixedBase,
    CurveGroup, VariableBaseMSM,
};
use ark_ff::{Field as _, PrimeField, UniformRand};
use ark_poly::{
    univariate::DensePolynomial, DenseUVPolynomial as _, EvaluationDomain as _,
    GeneralEvaluationDomain,
};
use ark_poly_commit::kzg10::{Powers, KZG10};
use ark_serialize::{CanonicalDeserialize as _, CanonicalSerialize as _};
use ark_std::rand::RngCore;
use num_traits::Zero as _;
use rayon::iter::{IntoParallelIterator as _, ParallelIterator as _};

use crate::{
    common::{EncodingParams, KzgRsError},
    Commitment, Proof,
};

type Kzg10Scheme = KZG10<Bn254, DensePolynomial<Fr>>;

/// Powers of tau in both groups. The G2 powers are needed for the length
/// (degree bound) commitments and proofs, which the stock
/// `ark_poly_commit::kzg10::UniversalParams` does not carry.
#[derive(Clone, Debug)]
pub struct GlobalParameters {
    /// `{ tau^i G1 }` for `i` in `0..order`.
    pub powers_of_g: Vec<G1Affine>,
    /// `{ tau^i G2 }` for `i` in `0..order`.
    pub powers_of_h: Vec<G2Affine>,
}

impl GlobalParameters {
    /// Number of powers loaded; also the exclusive degree bound.
    #[must_use]
    pub fn order(&self) -> usize {
        self.powers_of_g.len()
    }
}

/// Generate an SRS from local randomness. Use for development and tests
/// only; production material comes from a trusted setup ceremony via
/// [`global_parameters_from_file`].
pub fn global_parameters_from_randomness<R: RngCore>(
    order: usize,
    rng: &mut R,
) -> GlobalParameters {
    let tau = Fr::rand(rng);
    let g = G1Projective::rand(rng);
    let h = G2Projective::rand(rng);

    let mut powers_of_tau = Vec::with_capacity(order);
    let mut cur = Fr::ONE;
    for _ in 0..order {
        powers_of_tau.push(cur);
        cur *= tau;
    }

    let window_size = FixedBase::get_mul_window_size(order);
    let scalar_bits = Fr::MODULUS_BIT_SIZE as usize;

    let g_table = FixedBase::get_window_table(scalar_bits, window_size, g);
    let powers_of_g =
        FixedBase::msm::<G1Projective>(scalar_bits, window_size, &g_table, &powers_of_tau);
    let h_table = FixedBase::get_window_table(scalar_bits, window_size, h);
    let powers_of_h =
        FixedBase::msm::<G2Projective>(scalar_bits, window_size, &h_table, &powers_of_tau);

    GlobalParameters {
        powers_of_g: G1Projective::normalize_batch(&powers_of_g),
        powers_of_h: G2Projective::normalize_batch(&powers_of_h),
    }
}

/// Load the first `number_to_load` powers from serialized point files.
pub fn global_parameters_from_file(
    g1_path: &Path,
    g2_path: &Path,
    number_to_load: usize,
) -> Result<GlobalParameters, KzgRsError> {
    let mut powers_of_g =
        Vec::<G1Affine>::deserialize_uncompressed(File::open(g1_path)?)?;
    let mut powers_of_h =
        Vec::<G2Affine>::deserialize_uncompressed(File::open(g2_path)?)?;
    if powers_of_g.len() < number_to_load || powers_of_h.len() < number_to_load {
        return Err(KzgRsError::SrsTooSmall {
            degree: number_to_load,
            order: powers_of_g.len().min(powers_of_h.len()),
        });
    }
    powers_of_g.truncate(number_to_load);
    powers_of_h.truncate(number_to_load);
    Ok(GlobalParameters {
        powers_of_g,
        powers_of_h,
    })
}

/// Serialize an SRS into the files [`global_parameters_from_file`] reads.
pub fn write_global_parameters(
    global_parameters: &GlobalParameters,
    g1_path: &Path,
    g2_path: &Path,
) -> Result<(), KzgRsError> {
    let mut g1_bytes = Vec::new();
    global_parameters
        .powers_of_g
        .serialize_uncompressed(&mut g1_bytes)?;
    File::create(g1_path)?.write_all(&g1_bytes)?;
    let mut g2_bytes = Vec::new();
    global_parameters
        .powers_of_h
        .serialize_uncompressed(&mut g2_bytes)?;
    File::create(g2_path)?.write_all(&g2_bytes)?;
    Ok(())
}

/// Commit to a polynomial in G1.
pub fn commit_polynomial(
    polynomial: &DensePolynomial<Fr>,
    global_parameters: &GlobalParameters,
) -> Result<Commitment, KzgRsError> {
    let powers = Powers {
        powers_of_g: Cow::Borrowed(&global_parameters.powers_of_g),
        powers_of_gamma_g: Cow::Owned(vec![]),
    };
    Kzg10Scheme::commit(&powers, polynomial, None, None)
        .map_err(KzgRsError::PolyCommitError)
        .map(|(commitment, _)| commitment)
}

/// Commit to a polynomial in G2. Used as the length commitment: together
/// with the length proof it attests the committed polynomial's degree.
pub fn commit_polynomial_g2(
    polynomial: &DensePolynomial<Fr>,
    global_parameters: &GlobalParameters,
) -> Result<G2Affine, KzgRsError> {
    let coeffs = &polynomial.coeffs;
    if coeffs.len() > global_parameters.powers_of_h.len() {
        return Err(KzgRsError::SrsTooSmall {
            degree: coeffs.len(),
            order: global_parameters.order(),
        });
    }
    Ok(
        G2Projective::msm_unchecked(&global_parameters.powers_of_h[..coeffs.len()], coeffs)
            .into_affine(),
    )
}

/// Compute `[tau^(order - length) * p(tau)]_2`. The shifted powers run out
/// of the SRS unless `deg(p) < length`, so a valid proof can only exist for
/// polynomials within the claimed bound.
pub fn generate_length_proof(
    polynomial: &DensePolynomial<Fr>,
    length: usize,
    global_parameters: &GlobalParameters,
) -> Result<G2Affine, KzgRsError> {
    let order = global_parameters.order();
    let coeffs = &polynomial.coeffs;
    if length > order || coeffs.len() > length {
        return Err(KzgRsError::SrsTooSmall {
            degree: coeffs.len().max(length),
            order,
        });
    }
    let shift = order - length;
    Ok(G2Projective::msm_unchecked(
        &global_parameters.powers_of_h[shift..shift + coeffs.len()],
        coeffs,
    )
    .into_affine())
}

/// Check `e([tau^(order - length)]_1, C_2) == e(g_1, proof)` against the G2
/// length commitment.
#[must_use]
pub fn verify_length_proof(
    length_commitment: &G2Affine,
    length_proof: &G2Affine,
    length: usize,
    global_parameters: &GlobalParameters,
) -> bool {
    let order = global_parameters.order();
    if length == 0 || length > order {
        return false;
    }
    let shift = order - length;
    let lhs = Bn254::pairing(global_parameters.powers_of_g[shift], *length_commitment);
    let rhs = Bn254::pairing(global_parameters.powers_of_g[0], *length_proof);
    lhs == rhs
}

/// Quotient and remainder of division by the sparse binomial
/// `x^len - vanishing_offset`, in a single pass.
pub(crate) fn divide_by_coset_vanishing(
    coeffs: &[Fr],
    len: usize,
    vanishing_offset: Fr,
) -> (Vec<Fr>, Vec<Fr>) {
    let n = coeffs.len();
    if n <= len {
        return (Vec::new(), coeffs.to_vec());
    }
    let mut quotient = vec![Fr::zero(); n - len];
    for j in (0..n - len).rev() {
        let mut v = coeffs[j + len];
        if j + len < quotient.len() {
            v += vanishing_offset * quotient[j + len];
        }
        quotient[j] = v;
    }
    let mut remainder = coeffs[..len].to_vec();
    for j in 0..len.min(quotient.len()) {
        remainder[j] += vanishing_offset * quotient[j];
    }
    (quotient, remainder)
}

/// Evaluation positions of chunk `index`: the coset `w^index * <w^num_chunks>`
/// of the full domain, i.e. domain positions `index + k * num_chunks`.
#[must_use]
pub fn chunk_positions(index: u32, params: EncodingParams) -> impl Iterator<Item = usize> {
    let num_chunks = params.num_chunks as usize;
    (0..params.chunk_length as usize).map(move |k| index as usize + k * num_chunks)
}

fn coset_vanishing_offset(
    index: u32,
    params: EncodingParams,
    domain: GeneralEvaluationDomain<Fr>,
) -> Fr {
    // Z_index(x) = x^chunk_length - w^(index * chunk_length)
    domain.element(index as usize * params.chunk_length as usize)
}

/// Opening proof for one coset: the witness `[(p - r)/Z](tau)]_1` with
/// `r = p mod Z` left implicit (verifiers recompute it from the chunk).
pub fn generate_chunk_proof(
    polynomial: &DensePolynomial<Fr>,
    index: u32,
    params: EncodingParams,
    global_parameters: &GlobalParameters,
) -> Result<Proof, KzgRsError> {
    if index >= params.num_chunks {
        return Err(KzgRsError::ChunkIndexOutOfRange {
            index,
            num_chunks: params.num_chunks,
        });
    }
    let domain = encoding_domain(params)?;
    let offset = coset_vanishing_offset(index, params, domain);
    let (quotient, _remainder) = divide_by_coset_vanishing(
        &polynomial.coeffs,
        params.chunk_length as usize,
        offset,
    );
    let witness = DensePolynomial::from_coefficients_vec(quotient);
    let commitment = commit_polynomial(&witness, global_parameters)?;
    Ok(Proof {
        w: commitment.0,
        random_v: None,
    })
}

pub fn encoding_domain(params: EncodingParams) -> Result<GeneralEvaluationDomain<Fr>, KzgRsError> {
    params.validate()?;
    GeneralEvaluationDomain::new(params.domain_size()).ok_or(KzgRsError::UnsupportedDomainSize {
        size: params.domain_size(),
    })
}

/// Reed-Solomon extend the polynomial over the full domain and slice the
/// evaluations into per-chunk cosets, with one opening proof per chunk.
pub fn encode_chunks(
    polynomial: &DensePolynomial<Fr>,
    params: EncodingParams,
    global_parameters: &GlobalParameters,
) -> Result<(Vec<Vec<Fr>>, Vec<Proof>), KzgRsError> {
    let domain = encoding_domain(params)?;
    if polynomial.coeffs.len() > domain.size() {
        return Err(KzgRsError::BlobTooLarge {
            data_len: polynomial.coeffs.len(),
            capacity: domain.size(),
        });
    }
    let evaluations = domain.fft(&polynomial.coeffs);
    let chunks: Vec<Vec<Fr>> = (0..params.num_chunks)
        .map(|index| {
            chunk_positions(index, params)
                .map(|position| evaluations[position])
                .collect()
        })
        .collect();
    let proofs = (0..params.num_chunks)
        .into_par_iter()
        .map(|index| generate_chunk_proof(polynomial, index, params, global_parameters))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((chunks, proofs))
}

/// The unique polynomial of degree < chunk_length matching the chunk's
/// evaluations over its coset: a small-domain IFFT plus offset unscaling.
fn chunk_interpolant(
    evaluations: &[Fr],
    index: u32,
    params: EncodingParams,
    domain: GeneralEvaluationDomain<Fr>,
) -> Result<Vec<Fr>, KzgRsError> {
    let chunk_length = params.chunk_length as usize;
    if evaluations.len() != chunk_length {
        return Err(KzgRsError::InvalidChunk {
            expected: chunk_length,
            got: evaluations.len(),
        });
    }
    let small_domain = GeneralEvaluationDomain::<Fr>::new(chunk_length).ok_or(
        KzgRsError::UnsupportedDomainSize { size: chunk_length },
    )?;
    let scaled = small_domain.ifft(evaluations);
    let offset_inv = domain
        .element(index as usize)
        .inverse()
        .ok_or(KzgRsError::DivisionByZeroPolynomial)?;
    let mut power = Fr::ONE;
    Ok(scaled
        .into_iter()
        .map(|coeff| {
            let out = coeff * power;
            power *= offset_inv;
            out
        })
        .collect())
}

/// `[Z_index(tau)]_2` for the sparse coset vanishing binomial.
fn coset_vanishing_commitment(
    index: u32,
    params: EncodingParams,
    domain: GeneralEvaluationDomain<Fr>,
    global_parameters: &GlobalParameters,
) -> G2Projective {
    let offset = coset_vanishing_offset(index, params, domain);
    G2Projective::from(global_parameters.powers_of_h[params.chunk_length as usize])
        - global_parameters.powers_of_h[0] * offset
}

/// Verify one chunk's opening against the blob commitment:
/// `e(C - [r(tau)]_1, g_2) == e(W, [Z(tau)]_2)`.
pub fn verify_chunk(
    evaluations: &[Fr],
    proof: &Proof,
    index: u32,
    commitment: &Commitment,
    params: EncodingParams,
    global_parameters: &GlobalParameters,
) -> Result<bool, KzgRsError> {
    if index >= params.num_chunks {
        return Err(KzgRsError::ChunkIndexOutOfRange {
            index,
            num_chunks: params.num_chunks,
        });
    }
    let domain = encoding_domain(params)?;
    let interpolant =
        DensePolynomial::from_coefficients_vec(chunk_interpolant(evaluations, index, params, domain)?);
    let interpolant_commitment = commit_polynomial(&interpolant, global_parameters)?;
    let commitment_check = G1Projective::from(commitment.0) - interpolant_commitment.0;
    let vanishing = coset_vanishing_commitment(index, params, domain, global_parameters);
    let lhs = Bn254::pairing(commitment_check, global_parameters.powers_of_h[0]);
    let rhs = Bn254::pairing(proof.w, vanishing);
    Ok(lhs == rhs)
}

/// One chunk to be checked in a batched pairing, possibly from a different
/// blob than its neighbors.
pub struct ChunkSample<'a> {
    pub commitment: &'a Commitment,
    pub index: u32,
    pub evaluations: &'a [Fr],
    pub proof: &'a Proof,
}

/// Derive deterministic batching weights from a transcript of the samples,
/// so verification needs no randomness source.
fn batching_weights(samples: &[ChunkSample<'_>]) -> Result<Vec<Fr>, KzgRsError> {
    let mut transcript = Vec::new();
    for sample in samples {
        sample.commitment.serialize_compressed(&mut transcript)?;
        sample.proof.w.serialize_compressed(&mut transcript)?;
        transcript.extend_from_slice(&sample.index.to_be_bytes());
    }
    let seed = keccak256(&transcript);
    Ok((0..samples.len() as u64)
        .map(|i| {
            let mut buf = [0u8; 40];
            buf[..32].copy_from_slice(seed.as_slice());
            buf[32..].copy_from_slice(&i.to_be_bytes());
            Fr::from_le_bytes_mod_order(keccak256(buf).as_slice())
        })
        .collect())
}

/// Batched verification of many chunk openings with a single product of
/// pairings: sum_m gamma_m * (e(C_m - R_m, g_2) - e(W_m, Z_m)) == 0.
pub fn batch_verify_chunks(
    samples: &[ChunkSample<'_>],
    params: EncodingParams,
    global_parameters: &GlobalParameters,
) -> Result<bool, KzgRsError> {
    if samples.is_empty() {
        return Ok(true);
    }
    let domain = encoding_domain(params)?;
    let weights = batching_weights(samples)?;

    let mut lhs_accumulator = G1Projective::zero();
    let mut g1_terms = Vec::with_capacity(samples.len() + 1);
    let mut g2_terms = Vec::with_capacity(samples.len() + 1);
    for (sample, weight) in samples.iter().zip(&weights) {
        if sample.index >= params.num_chunks {
            return Err(KzgRsError::ChunkIndexOutOfRange {
                index: sample.index,
                num_chunks: params.num_chunks,
            });
        }
        let interpolant = DensePolynomial::from_coefficients_vec(chunk_interpolant(
            sample.evaluations,
            sample.index,
            params,
            domain,
        )?);
        let interpolant_commitment = commit_polynomial(&interpolant, global_parameters)?;
        lhs_accumulator +=
            (G1Projective::from(sample.commitment.0) - interpolant_commitment.0) * weight;
        g1_terms.push(-(G1Projective::from(sample.proof.w) * weight));
        g2_terms.push(coset_vanishing_commitment(
            sample.index,
            params,
            domain,
            global_parameters,
        ));
    }
    g1_terms.push(lhs_accumulator);
    g2_terms.push(G2Projective::from(global_parameters.powers_of_h[0]));

    let product = Bn254::multi_pairing(g1_terms, g2_terms);
    Ok(product == PairingOutput::zero())
}

#[cfg(test)]
mod test {
    use std::sync::LazyLock;

    use ark_std::rand::thread_rng;
    use num_traits::{One as _, Zero as _};

    use super::*;
    use crate::common::bytes_to_polynomial;

    const SRS_ORDER: usize = 64;

    static GLOBAL_PARAMETERS: LazyLock<GlobalParameters> =
        LazyLock::new(|| global_parameters_from_randomness(SRS_ORDER, &mut thread_rng()));

    static PARAMS: LazyLock<EncodingParams> =
        LazyLock::new(|| EncodingParams::new(4, 8).unwrap());

    fn rand_bytes(len: usize) -> Vec<u8> {
        let mut rng = thread_rng();
        let mut bytes = vec![0u8; len];
        rng.fill_bytes(&mut bytes);
        bytes
    }

    #[test]
    fn sparse_division_reconstructs() {
        let data = rand_bytes(310);
        let poly = bytes_to_polynomial(&data);
        let offset = Fr::from(7u64);
        let (q, r) = divide_by_coset_vanishing(&poly.coeffs, 4, offset);
        // p == q * (x^4 - offset) + r
        let vanishing = DensePolynomial::from_coefficients_vec(vec![
            -offset,
            Fr::zero(),
            Fr::zero(),
            Fr::zero(),
            Fr::one(),
        ]);
        let rebuilt = &(&DensePolynomial::from_coefficients_vec(q) * &vanishing)
            + &DensePolynomial::from_coefficients_vec(r);
        assert_eq!(rebuilt, poly);
    }

    #[test]
    fn chunk_proofs_verify() {
        let data = rand_bytes(12 * 31);
        let poly = bytes_to_polynomial(&data);
        let commitment = commit_polynomial(&poly, &GLOBAL_PARAMETERS).unwrap();
        let (chunks, proofs) = encode_chunks(&poly, *PARAMS, &GLOBAL_PARAMETERS).unwrap();

        for (index, (chunk, proof)) in chunks.iter().zip(&proofs).enumerate() {
            assert!(verify_chunk(
                chunk,
                proof,
                index as u32,
                &commitment,
                *PARAMS,
                &GLOBAL_PARAMETERS
            )
            .unwrap());
            // proof must not verify at a different coset
            let other = (index as u32 + 1) % PARAMS.num_chunks;
            assert!(!verify_chunk(
                chunk,
                proof,
                other,
                &commitment,
                *PARAMS,
                &GLOBAL_PARAMETERS
            )
            .unwrap());
        }
    }

    #[test]
    fn tampered_chunk_fails() {
        let data = rand_bytes(10 * 31);
        let poly = bytes_to_polynomial(&data);
        let commitment = commit_polynomial(&poly, &GLOBAL_PARAMETERS).unwrap();
        let (mut chunks, proofs) = encode_chunks(&poly, *PARAMS, &GLOBAL_PARAMETERS).unwrap();
        chunks[3][1] += Fr::one();
        assert!(!verify_chunk(
            &chunks[3],
            &proofs[3],
            3,
            &commitment,
            *PARAMS,
            &GLOBAL_PARAMETERS
        )
        .unwrap());
    }

    #[test]
    fn batched_verification() {
        let data_a = rand_bytes(12 * 31);
        let data_b = rand_bytes(6 * 31);
        let poly_a = bytes_to_polynomial(&data_a);
        let poly_b = bytes_to_polynomial(&data_b);
        let commitment_a = commit_polynomial(&poly_a, &GLOBAL_PARAMETERS).unwrap();
        let commitment_b = commit_polynomial(&poly_b, &GLOBAL_PARAMETERS).unwrap();
        let (chunks_a, proofs_a) = encode_chunks(&poly_a, *PARAMS, &GLOBAL_PARAMETERS).unwrap();
        let (mut chunks_b, proofs_b) = encode_chunks(&poly_b, *PARAMS, &GLOBAL_PARAMETERS).unwrap();

        let samples: Vec<ChunkSample<'_>> = chunks_a
            .iter()
            .zip(&proofs_a)
            .enumerate()
            .map(|(i, (chunk, proof))| ChunkSample {
                commitment: &commitment_a,
                index: i as u32,
                evaluations: chunk,
                proof,
            })
            .chain(
                chunks_b
                    .iter()
                    .zip(&proofs_b)
                    .enumerate()
                    .map(|(i, (chunk, proof))| ChunkSample {
                        commitment: &commitment_b,
                        index: i as u32,
                        evaluations: chunk,
                        proof,
                    }),
            )
            .collect();
        assert!(batch_verify_chunks(&samples, *PARAMS, &GLOBAL_PARAMETERS).unwrap());
        drop(samples);

        chunks_b[0][0] += Fr::one();
        let samples: Vec<ChunkSample<'_>> = chunks_b
            .iter()
            .zip(&proofs_b)
            .enumerate()
            .map(|(i, (chunk, proof))| ChunkSample {
                commitment: &commitment_b,
                index: i as u32,
                evaluations: chunk,
                proof,
            })
            .collect();
        assert!(!batch_verify_chunks(&samples, *PARAMS, &GLOBAL_PARAMETERS).unwrap());
    }

    #[test]
    fn length_proof() {
        let data = rand_bytes(9 * 31);
        let poly = bytes_to_polynomial(&data);
        let length = poly.coeffs.len();
        let length_commitment = commit_polynomial_g2(&poly, &GLOBAL_PARAMETERS).unwrap();
        let proof = generate_length_proof(&poly, length, &GLOBAL_PARAMETERS).unwrap();
        assert!(verify_length_proof(
            &length_commitment,
            &proof,
            length,
            &GLOBAL_PARAMETERS
        ));
        // under-claiming the degree must not verify
        assert!(!verify_length_proof(
            &length_commitment,
            &proof,
            length - 1,
            &GLOBAL_PARAMETERS
        ));
        // a proof for a tighter bound than the polynomial cannot be built
        assert!(generate_length_proof(&poly, length - 1, &GLOBAL_PARAMETERS).is_err());
    }
}
