use ark_bn254::Fr;
use ark_ff::{BigInteger as _, PrimeField as _};
use ark_poly::{univariate::DensePolynomial, DenseUVPolynomial as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Each field element carries 31 bytes of payload so that any packed value
/// stays below the BN254 scalar modulus.
pub const BYTES_PER_FIELD_ELEMENT: usize = 31;

#[derive(Debug, Error)]
pub enum KzgRsError {
    #[error("data of {data_len} bytes exceeds the {capacity} byte capacity of the encoding domain")]
    BlobTooLarge { data_len: usize, capacity: usize },
    #[error("chunk length {chunk_length} and chunk count {num_chunks} must be nonzero powers of two")]
    InvalidEncodingParams { chunk_length: u32, num_chunks: u32 },
    #[error("no radix-2 evaluation domain of size {size}")]
    UnsupportedDomainSize { size: usize },
    #[error("polynomial of {degree} coefficients exceeds the {order} element SRS")]
    SrsTooSmall { degree: usize, order: usize },
    #[error("chunk index {index} out of range for {num_chunks} chunks")]
    ChunkIndexOutOfRange { index: u32, num_chunks: u32 },
    #[error("{got} evaluation points cannot recover {needed} coefficients")]
    NotEnoughPoints { needed: usize, got: usize },
    #[error("mismatched chunk and index counts")]
    ChunkIndexMismatch,
    #[error("chunk carries {got} evaluations, expected {expected}")]
    InvalidChunk { expected: usize, got: usize },
    #[error("division by zero polynomial")]
    DivisionByZeroPolynomial,
    #[error(transparent)]
    PolyCommitError(#[from] ark_poly_commit::Error),
    #[error("failed to read SRS file: {0}")]
    SrsIo(#[from] std::io::Error),
    #[error("failed to decode SRS file: {0}")]
    SrsFormat(#[from] ark_serialize::SerializationError),
}

/// Shape of one erasure coding: `num_chunks` cosets of `chunk_length`
/// evaluations each, over a radix-2 domain of their product.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncodingParams {
    pub chunk_length: u32,
    pub num_chunks: u32,
}

impl EncodingParams {
    pub fn new(chunk_length: u32, num_chunks: u32) -> Result<Self, KzgRsError> {
        let params = Self {
            chunk_length,
            num_chunks,
        };
        params.validate()?;
        Ok(params)
    }

    /// Smallest valid parameters covering the given minimums.
    pub fn from_mins(min_chunk_length: u32, min_num_chunks: u32) -> Self {
        Self {
            chunk_length: min_chunk_length.max(1).next_power_of_two(),
            num_chunks: min_num_chunks.max(1).next_power_of_two(),
        }
    }

    pub fn validate(&self) -> Result<(), KzgRsError> {
        if self.chunk_length == 0
            || self.num_chunks == 0
            || !self.chunk_length.is_power_of_two()
            || !self.num_chunks.is_power_of_two()
        {
            return Err(KzgRsError::InvalidEncodingParams {
                chunk_length: self.chunk_length,
                num_chunks: self.num_chunks,
            });
        }
        Ok(())
    }

    pub const fn domain_size(&self) -> usize {
        self.chunk_length as usize * self.num_chunks as usize
    }

    /// Maximum payload the encoding domain can hold.
    pub const fn capacity_bytes(&self) -> usize {
        self.domain_size() * BYTES_PER_FIELD_ELEMENT
    }
}

/// Number of field elements needed to pack `data_len` bytes.
#[must_use]
pub const fn num_field_elements(data_len: usize) -> usize {
    data_len.div_ceil(BYTES_PER_FIELD_ELEMENT)
}

/// Pack bytes into field elements, 31 bytes per element, little endian.
/// The packed elements are the *coefficients* of the message polynomial.
#[must_use]
pub fn bytes_to_coefficients(data: &[u8]) -> Vec<Fr> {
    data.chunks(BYTES_PER_FIELD_ELEMENT)
        .map(Fr::from_le_bytes_mod_order)
        .collect()
}

#[must_use]
pub fn bytes_to_polynomial(data: &[u8]) -> DensePolynomial<Fr> {
    DensePolynomial::from_coefficients_vec(bytes_to_coefficients(data))
}

/// Unpack field elements back into bytes, inverse of [`bytes_to_coefficients`].
#[must_use]
pub fn field_elements_to_bytes(elements: &[Fr]) -> Vec<u8> {
    elements
        .iter()
        .flat_map(|e| {
            e.into_bigint()
                .to_bytes_le()
                .into_iter()
                .take(BYTES_PER_FIELD_ELEMENT)
        })
        .collect()
}
