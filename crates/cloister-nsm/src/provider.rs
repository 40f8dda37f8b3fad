//! Attestation provider: the shared, serialized path to the NSM.

use crate::driver::{DevNsm, NsmDevice, NsmDriver};
use crate::NsmError;
use aws_nitro_enclaves_nsm_api::api::{Request, Response};
use serde_bytes::ByteBuf;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;
use zeroize::Zeroizing;

/// Bytes written into the system entropy pool at startup.
pub const SEED_QUANTUM: usize = 1024;

/// Serialized access to one NSM session. Safe to call from any number of
/// tasks; each request runs on the blocking tier while holding the session
/// lock, because the device ioctl cannot be cancelled mid-call.
#[derive(Clone)]
pub struct AttestationProvider {
    driver: Arc<Mutex<Box<dyn NsmDriver>>>,
}

impl AttestationProvider {
    pub fn with_driver(driver: Box<dyn NsmDriver>) -> Self {
        Self {
            driver: Arc::new(Mutex::new(driver)),
        }
    }

    /// Open the real device.
    pub fn device() -> Result<Self, NsmError> {
        Ok(Self::with_driver(Box::new(NsmDevice::open()?)))
    }

    /// Development backend; no device required.
    pub fn dev() -> Self {
        Self::with_driver(Box::new(DevNsm))
    }

    /// Select the backend from `CLOISTER_NSM` (`device` | `dev`), defaulting
    /// to the real device.
    pub fn from_env() -> Result<Self, NsmError> {
        match std::env::var("CLOISTER_NSM").as_deref() {
            Ok("dev") => Ok(Self::dev()),
            _ => Self::device(),
        }
    }

    async fn process(&self, request: Request) -> Result<Response, NsmError> {
        let driver = self.driver.clone();
        tokio::task::spawn_blocking(move || {
            let driver = driver.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            driver.process(request)
        })
        .await
        .map_err(|_| NsmError::TaskFailed)
    }

    /// Accumulate `n` bytes of device entropy from repeated `GetRandom`
    /// requests.
    pub async fn read_entropy(&self, n: usize) -> Result<Vec<u8>, NsmError> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            match self.process(Request::GetRandom).await? {
                Response::GetRandom { random } if !random.is_empty() => {
                    let take = random.len().min(n - out.len());
                    out.extend_from_slice(&random[..take]);
                }
                Response::Error(code) => {
                    return Err(NsmError::EntropyUnavailable(format!("{code:?}")))
                }
                _ => return Err(NsmError::EntropyUnavailable("empty response".to_string())),
            }
        }
        Ok(out)
    }

    /// Produce a signed attestation document over `(nonce, user_data,
    /// public_key)`. The public key, when present, is SubjectPublicKeyInfo
    /// DER.
    pub async fn attest(
        &self,
        nonce: Option<Vec<u8>>,
        user_data: Option<Vec<u8>>,
        public_key: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, NsmError> {
        let request = Request::Attestation {
            nonce: nonce.map(ByteBuf::from),
            user_data: user_data.map(ByteBuf::from),
            public_key: public_key.map(ByteBuf::from),
        };
        match self.process(request).await? {
            Response::Attestation { document } if !document.is_empty() => Ok(document),
            Response::Attestation { .. } => Err(NsmError::EmptyDocument),
            Response::Error(code) => Err(NsmError::Device(format!("{code:?}"))),
            _ => Err(NsmError::Device("unexpected response".to_string())),
        }
    }
}

/// Seed the system entropy pool with one [`SEED_QUANTUM`] of device entropy.
/// Must complete before anything RNG-dependent starts.
pub async fn seed_system_entropy(
    provider: &AttestationProvider,
    path: impl AsRef<Path>,
) -> Result<(), NsmError> {
    let path = path.as_ref();
    let entropy = Zeroizing::new(provider.read_entropy(SEED_QUANTUM).await?);
    tokio::fs::write(path, entropy.as_slice())
        .await
        .map_err(|source| NsmError::SeedWrite {
            path: path.display().to_string(),
            source,
        })?;
    info!(path = %path.display(), bytes = SEED_QUANTUM, "entropy pool seeded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entropy_accumulates_across_requests() {
        let provider = AttestationProvider::dev();
        let entropy = provider.read_entropy(1000).await.unwrap();
        assert_eq!(entropy.len(), 1000);
        // 1000 bytes of OS randomness are never all equal.
        assert!(entropy.iter().any(|b| *b != entropy[0]));
    }

    #[tokio::test]
    async fn dev_attestation_embeds_inputs() {
        let provider = AttestationProvider::dev();
        let doc = provider
            .attest(Some(vec![7u8; 32]), None, Some(b"spki-bytes".to_vec()))
            .await
            .unwrap();
        let value: serde_cbor::Value = serde_cbor::from_slice(&doc).unwrap();
        let serde_cbor::Value::Map(map) = value else {
            panic!("document is not a map");
        };
        let key = serde_cbor::Value::Text("public_key".into());
        assert_eq!(
            map.get(&key),
            Some(&serde_cbor::Value::Bytes(b"spki-bytes".to_vec()))
        );
    }

    #[tokio::test]
    async fn seed_writes_quantum_to_path() {
        let provider = AttestationProvider::dev();
        let dir = std::env::temp_dir().join(format!("cloister-seed-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("random");
        seed_system_entropy(&provider, &path).await.unwrap();
        let written = tokio::fs::read(&path).await.unwrap();
        assert_eq!(written.len(), SEED_QUANTUM);
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
