pub mod common;
pub mod kzg;
pub mod rs;

use ark_bn254::{Bn254, Fr};
use ark_poly::GeneralEvaluationDomain;
use ark_poly_commit::kzg10;

pub use common::{
    bytes_to_coefficients, bytes_to_polynomial, field_elements_to_bytes, num_field_elements,
    EncodingParams, KzgRsError, BYTES_PER_FIELD_ELEMENT,
};
pub use kzg::{
    global_parameters_from_file, global_parameters_from_randomness, write_global_parameters,
    GlobalParameters,
};

pub type FieldElement = Fr;
pub type Commitment = kzg10::Commitment<Bn254>;
pub type Proof = kzg10::Proof<Bn254>;
pub type G2Commitment = ark_bn254::G2Affine;
pub type PolynomialEvaluationDomain = GeneralEvaluationDomain<Fr>;
