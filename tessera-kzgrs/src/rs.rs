use ark_bn254::Fr;
use ark_ff::Field as _;
use ark_poly::{
    univariate::DensePolynomial, DenseUVPolynomial as _, EvaluationDomain as _,
    GeneralEvaluationDomain,
};
use num_traits::Zero as _;

use crate::{
    common::{EncodingParams, KzgRsError},
    kzg::{chunk_positions, divide_by_coset_vanishing, encoding_domain},
};

/// Recover the message polynomial's coefficients from any sufficient subset
/// of coded chunks. `chunk_indices[i]` names the coset `chunks[i]` was
/// evaluated over, which fixes the domain position of every point.
pub fn decode_chunks(
    chunks: &[&[Fr]],
    chunk_indices: &[u32],
    params: EncodingParams,
    num_coefficients: usize,
) -> Result<DensePolynomial<Fr>, KzgRsError> {
    if chunks.len() != chunk_indices.len() {
        return Err(KzgRsError::ChunkIndexMismatch);
    }
    let domain = encoding_domain(params)?;

    let mut positions = Vec::with_capacity(num_coefficients);
    let mut values = Vec::with_capacity(num_coefficients);
    'collect: for (chunk, &index) in chunks.iter().zip(chunk_indices) {
        if index >= params.num_chunks {
            return Err(KzgRsError::ChunkIndexOutOfRange {
                index,
                num_chunks: params.num_chunks,
            });
        }
        for (position, value) in chunk_positions(index, params).zip(chunk.iter()) {
            positions.push(position);
            values.push(*value);
            if values.len() == num_coefficients {
                break 'collect;
            }
        }
    }
    if values.len() < num_coefficients {
        return Err(KzgRsError::NotEnoughPoints {
            needed: num_coefficients,
            got: values.len(),
        });
    }
    Ok(interpolate_at_positions(&positions, &values, domain))
}

/// The unique polynomial of degree < n through n domain-position points.
/// Builds the vanishing product over all positions once, then peels each
/// Lagrange basis numerator off it with the same synthetic division the
/// coset openings use, accumulating it scaled by its point value.
fn interpolate_at_positions(
    positions: &[usize],
    values: &[Fr],
    domain: GeneralEvaluationDomain<Fr>,
) -> DensePolynomial<Fr> {
    let xs: Vec<Fr> = positions
        .iter()
        .map(|position| domain.element(*position))
        .collect();

    // Z(x) = prod_i (x - x_i)
    let mut vanishing = vec![Fr::ONE];
    for x in &xs {
        let mut next = vec![Fr::zero(); vanishing.len() + 1];
        for (power, coeff) in vanishing.iter().enumerate() {
            next[power + 1] += coeff;
            next[power] -= *x * coeff;
        }
        vanishing = next;
    }

    let mut coefficients = vec![Fr::zero(); xs.len()];
    for (x, value) in xs.iter().zip(values) {
        // numerator_i = Z / (x - x_i); its value at x_i is the barycentric
        // denominator prod_{j != i} (x_i - x_j)
        let (numerator, _) = divide_by_coset_vanishing(&vanishing, 1, *x);
        let denominator = numerator
            .iter()
            .rev()
            .fold(Fr::zero(), |acc, coeff| acc * x + coeff);
        let scale = *value
            * denominator
                .inverse()
                .expect("domain positions are distinct");
        for (coefficient, coeff) in coefficients.iter_mut().zip(&numerator) {
            *coefficient += scale * coeff;
        }
    }
    DensePolynomial::from_coefficients_vec(coefficients)
}
