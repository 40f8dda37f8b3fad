//! Attestation device access and the enclave's ephemeral recipient key.
//!
//! The provider is the only path to the Nitro Security Module: it owns the
//! device session, serializes requests, and runs the blocking ioctls on the
//! runtime's blocking tier. A development backend stands in for the device on
//! hosts without `/dev/nsm`.

pub mod driver;
pub mod keys;
pub mod provider;

pub use driver::{DevNsm, NsmDevice, NsmDriver};
pub use keys::{EphemeralKey, KeyError, KeyMaterial, RSA_KEY_BITS};
pub use provider::{seed_system_entropy, AttestationProvider, SEED_QUANTUM};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NsmError {
    #[error("attestation device unavailable")]
    DeviceUnavailable,
    #[error("entropy unavailable: {0}")]
    EntropyUnavailable(String),
    #[error("attestation device error: {0}")]
    Device(String),
    #[error("attestation reply carried no document")]
    EmptyDocument,
    #[error("attestation task failed")]
    TaskFailed,
    #[error("failed to write entropy to {path}")]
    SeedWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
