//! Process-wide ephemeral RSA keypair used as the attestation recipient
//! identity.

use once_cell::sync::OnceCell;
use rsa::pkcs8::EncodePublicKey;
use rsa::rand_core::OsRng;
use rsa::{RsaPrivateKey, RsaPublicKey};
use thiserror::Error;
use tracing::info;

pub const RSA_KEY_BITS: usize = 2048;

#[derive(Debug, Clone, Error)]
pub enum KeyError {
    #[error("failed to generate ephemeral RSA key: {0}")]
    Generate(String),
    #[error("failed to encode ephemeral public key: {0}")]
    Encode(String),
}

/// The generated pair plus the cached SubjectPublicKeyInfo DER encoding of
/// the public half, which is what goes into attestation documents.
pub struct KeyMaterial {
    private: RsaPrivateKey,
    public: RsaPublicKey,
    public_spki_der: Vec<u8>,
}

impl KeyMaterial {
    pub fn private(&self) -> &RsaPrivateKey {
        &self.private
    }

    pub fn public(&self) -> &RsaPublicKey {
        &self.public
    }

    pub fn public_spki_der(&self) -> &[u8] {
        &self.public_spki_der
    }
}

/// Lazily-generated keypair with exactly one generation attempt for the life
/// of the process. A failed generation is sticky: every later call observes
/// the original error. Callers should hold on to the returned reference
/// rather than re-resolving it on the hot path.
#[derive(Default)]
pub struct EphemeralKey {
    cell: OnceCell<Result<KeyMaterial, KeyError>>,
}

impl EphemeralKey {
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    pub fn material(&self) -> Result<&KeyMaterial, KeyError> {
        self.cell
            .get_or_init(generate)
            .as_ref()
            .map_err(|e| e.clone())
    }
}

fn generate() -> Result<KeyMaterial, KeyError> {
    let mut rng = OsRng;
    let private = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
        .map_err(|e| KeyError::Generate(e.to_string()))?;
    let public = RsaPublicKey::from(&private);
    let public_spki_der = public
        .to_public_key_der()
        .map_err(|e| KeyError::Encode(e.to_string()))?
        .into_vec();
    info!(bits = RSA_KEY_BITS, "ephemeral recipient key generated");
    Ok(KeyMaterial {
        private,
        public,
        public_spki_der,
    })
}
