use std::sync::LazyLock;

use tessera_kzgrs::{global_parameters_from_randomness, GlobalParameters};

pub const DEV_SRS_ORDER: usize = 1 << 9;

/// Randomly generated SRS for development and tests. Production deployments
/// load ceremony output through [`crate::EncoderConfig`] paths instead.
pub static GLOBAL_PARAMETERS: LazyLock<GlobalParameters> = LazyLock::new(|| {
    println!("WARNING: KZG global parameters are randomly generated. Use for development only.");
    let mut rng = rand::thread_rng();
    global_parameters_from_randomness(DEV_SRS_ORDER, &mut rng)
});
