pub mod global;

use std::{
    num::NonZeroUsize,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tracing::debug;

use tessera_core::{
    blob::{BlobCommitments, Chunk},
    encoding::{Encoder, EncodingError, Sample},
};
use tessera_kzgrs::{
    bytes_to_polynomial, field_elements_to_bytes, kzg, num_field_elements, rs, EncodingParams,
    GlobalParameters, KzgRsError,
};

const ENCODING_CACHE_SIZE: usize = 128;

/// Trusted setup material locations and sizing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KzgConfig {
    pub g1_path: PathBuf,
    pub g2_path: PathBuf,
    /// Total powers available in the setup files.
    pub srs_order: usize,
    /// How many powers to load at startup.
    pub srs_number_to_load: usize,
    /// Scratch directory for precomputed tables; unused by this backend but
    /// kept in the config surface for operational parity.
    pub cache_dir: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub kzg: KzgConfig,
    /// Cache encode results so re-encoding the same blob (e.g. after a
    /// reorg) skips proof generation.
    pub cache_encoded_blobs: bool,
}

#[derive(Clone)]
struct CachedEncoding {
    commitments: BlobCommitments,
    chunks: Vec<Chunk>,
}

/// KZG + Reed-Solomon encoder over a load-once SRS shared by all workers.
pub struct TesseraEncoder {
    global_parameters: Arc<GlobalParameters>,
    cache: Option<Mutex<LruCache<[u8; 32], CachedEncoding>>>,
}

impl TesseraEncoder {
    /// Load the SRS from the configured files. Callers construct the encoder
    /// before starting any loop, so a load failure stops the process early.
    pub fn new(config: &EncoderConfig) -> Result<Self, EncodingError> {
        let global_parameters = kzg::global_parameters_from_file(
            &config.kzg.g1_path,
            &config.kzg.g2_path,
            config.kzg.srs_number_to_load,
        )?;
        Ok(Self::with_global_parameters(
            Arc::new(global_parameters),
            config.cache_encoded_blobs,
        ))
    }

    pub fn with_global_parameters(
        global_parameters: Arc<GlobalParameters>,
        cache_encoded_blobs: bool,
    ) -> Self {
        let cache = cache_encoded_blobs.then(|| {
            Mutex::new(LruCache::new(
                NonZeroUsize::new(ENCODING_CACHE_SIZE).expect("cache size is nonzero"),
            ))
        });
        Self {
            global_parameters,
            cache,
        }
    }

    fn cache_key(data: &[u8], params: EncodingParams) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.update(params.chunk_length.to_be_bytes());
        hasher.update(params.num_chunks.to_be_bytes());
        hasher.finalize().into()
    }
}

impl Encoder for TesseraEncoder {
    fn encode(
        &self,
        data: &[u8],
        params: EncodingParams,
    ) -> Result<(BlobCommitments, Vec<Chunk>), EncodingError> {
        let key = self.cache.as_ref().map(|_| Self::cache_key(data, params));
        if let (Some(cache), Some(key)) = (self.cache.as_ref(), key.as_ref()) {
            if let Some(hit) = cache.lock().expect("cache lock poisoned").get(key) {
                debug!(chunk_length = params.chunk_length, "encoding cache hit");
                return Ok((hit.commitments.clone(), hit.chunks.clone()));
            }
        }

        if data.len() > params.capacity_bytes() {
            return Err(KzgRsError::BlobTooLarge {
                data_len: data.len(),
                capacity: params.capacity_bytes(),
            }
            .into());
        }
        let length = num_field_elements(data.len()) as u32;
        let polynomial = bytes_to_polynomial(data);

        let commitment = kzg::commit_polynomial(&polynomial, &self.global_parameters)?;
        let length_commitment = kzg::commit_polynomial_g2(&polynomial, &self.global_parameters)?;
        let length_proof =
            kzg::generate_length_proof(&polynomial, length as usize, &self.global_parameters)?;
        let (evaluations, proofs) =
            kzg::encode_chunks(&polynomial, params, &self.global_parameters)?;

        let commitments = BlobCommitments {
            commitment,
            length_commitment,
            length_proof,
            length,
        };
        let chunks: Vec<Chunk> = evaluations
            .into_iter()
            .zip(proofs)
            .map(|(coeffs, proof)| Chunk { coeffs, proof })
            .collect();

        if let (Some(cache), Some(key)) = (self.cache.as_ref(), key) {
            cache.lock().expect("cache lock poisoned").put(
                key,
                CachedEncoding {
                    commitments: commitments.clone(),
                    chunks: chunks.clone(),
                },
            );
        }
        Ok((commitments, chunks))
    }

    fn verify_blob_length(&self, commitments: &BlobCommitments) -> Result<(), EncodingError> {
        if kzg::verify_length_proof(
            &commitments.length_commitment,
            &commitments.length_proof,
            commitments.length as usize,
            &self.global_parameters,
        ) {
            Ok(())
        } else {
            Err(EncodingError::InvalidLengthProof)
        }
    }

    fn verify_chunks(
        &self,
        chunks: &[Chunk],
        indices: &[u32],
        commitments: &BlobCommitments,
        params: EncodingParams,
    ) -> Result<(), EncodingError> {
        if chunks.len() != indices.len() {
            return Err(EncodingError::ChunkIndexMismatch);
        }
        for (chunk, &index) in chunks.iter().zip(indices) {
            let valid = kzg::verify_chunk(
                &chunk.coeffs,
                &chunk.proof,
                index,
                &commitments.commitment,
                params,
                &self.global_parameters,
            )?;
            if !valid {
                return Err(EncodingError::InvalidChunkProof { index });
            }
        }
        Ok(())
    }

    fn universal_verify_sub_batch(
        &self,
        params: EncodingParams,
        samples: &[Sample<'_>],
        num_blobs: usize,
    ) -> Result<(), EncodingError> {
        let kzg_samples: Vec<kzg::ChunkSample<'_>> = samples
            .iter()
            .map(|sample| kzg::ChunkSample {
                commitment: &sample.commitments.commitment,
                index: sample.assignment_index,
                evaluations: &sample.chunk.coeffs,
                proof: &sample.chunk.proof,
            })
            .collect();
        if kzg::batch_verify_chunks(&kzg_samples, params, &self.global_parameters)? {
            Ok(())
        } else {
            Err(EncodingError::InvalidSubBatch { num_blobs })
        }
    }

    fn decode(
        &self,
        chunks: &[Chunk],
        indices: &[u32],
        params: EncodingParams,
        max_input_size: usize,
    ) -> Result<Vec<u8>, EncodingError> {
        if chunks.len() != indices.len() {
            return Err(EncodingError::ChunkIndexMismatch);
        }
        let num_coefficients = num_field_elements(max_input_size);
        let coeff_slices: Vec<&[tessera_kzgrs::FieldElement]> =
            chunks.iter().map(|chunk| chunk.coeffs.as_slice()).collect();
        let polynomial = rs::decode_chunks(&coeff_slices, indices, params, num_coefficients)?;
        let mut coefficients = polynomial.coeffs;
        // interpolation trims trailing zero coefficients; restore them so the
        // byte conversion covers the full claimed size
        coefficients.resize(num_coefficients, tessera_kzgrs::FieldElement::from(0u64));
        let mut bytes = field_elements_to_bytes(&coefficients);
        bytes.truncate(max_input_size);
        Ok(bytes)
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, LazyLock};

    use ark_std::rand::{thread_rng, RngCore as _};

    use super::*;
    use crate::global::GLOBAL_PARAMETERS;

    static ENCODER: LazyLock<TesseraEncoder> = LazyLock::new(|| {
        TesseraEncoder::with_global_parameters(Arc::new(GLOBAL_PARAMETERS.clone()), true)
    });

    static PARAMS: LazyLock<EncodingParams> = LazyLock::new(|| EncodingParams::new(8, 8).unwrap());

    fn rand_data(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        thread_rng().fill_bytes(&mut data);
        data
    }

    #[test]
    fn encode_decode_roundtrip() {
        let data = rand_data(1488);
        let (commitments, chunks) = ENCODER.encode(&data, *PARAMS).unwrap();
        assert_eq!(commitments.length, num_field_elements(data.len()) as u32);

        // any length-covering subset of chunks decodes to the original bytes
        let subset: Vec<Chunk> = chunks.iter().skip(1).cloned().collect();
        let indices: Vec<u32> = (1..PARAMS.num_chunks).collect();
        let decoded = ENCODER
            .decode(&subset, &indices, *PARAMS, data.len())
            .unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn verify_chunks_accepts_valid_and_rejects_tampered() {
        let data = rand_data(1000);
        let (commitments, mut chunks) = ENCODER.encode(&data, *PARAMS).unwrap();
        let indices: Vec<u32> = (0..PARAMS.num_chunks).collect();
        ENCODER
            .verify_chunks(&chunks, &indices, &commitments, *PARAMS)
            .unwrap();

        chunks[2].coeffs[0] += tessera_kzgrs::FieldElement::from(1u64);
        assert!(matches!(
            ENCODER.verify_chunks(&chunks, &indices, &commitments, *PARAMS),
            Err(EncodingError::InvalidChunkProof { index: 2 })
        ));
    }

    #[test]
    fn blob_length_verification() {
        let data = rand_data(500);
        let (mut commitments, _) = ENCODER.encode(&data, *PARAMS).unwrap();
        ENCODER.verify_blob_length(&commitments).unwrap();

        commitments.length -= 1;
        assert!(ENCODER.verify_blob_length(&commitments).is_err());
    }

    #[test]
    fn cache_returns_identical_results() {
        let data = rand_data(800);
        let first = ENCODER.encode(&data, *PARAMS).unwrap();
        let second = ENCODER.encode(&data, *PARAMS).unwrap();
        assert_eq!(first.0, second.0);
        assert_eq!(first.1, second.1);
    }

    #[test]
    fn oversized_blob_is_rejected() {
        let data = rand_data(PARAMS.capacity_bytes() + 1);
        assert!(ENCODER.encode(&data, *PARAMS).is_err());
    }
}
