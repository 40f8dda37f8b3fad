//! Manifest schema for cloister images.
//!
//! The manifest is baked into the enclave image at build time and read by
//! both supervisors. It is loaded once, validated, and never mutated.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// The single manifest version this build understands.
pub const SUPPORTED_VERSION: &str = "v1";

/// Loopback port reserved for the egress HTTP proxy on both sides.
const EGRESS_PROXY_PORT: u16 = 3128;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest")]
    Parse(#[from] serde_yaml::Error),
    #[error("unsupported manifest version {0:?}, expected {SUPPORTED_VERSION:?}")]
    UnsupportedVersion(String),
    #[error("invalid name {0:?}: must be a DNS-1123 label")]
    InvalidName(String),
    #[error("invalid listen port {0}")]
    InvalidPort(u16),
    #[error("duplicate ingress port {0}")]
    DuplicateIngressPort(u16),
    #[error("port {0} is reserved for the egress proxy")]
    ReservedPort(u16),
    #[error("kms_proxy.listen_port {0} must not appear in ingress")]
    KmsPortExposed(u16),
    #[error("defaults.cpu_count must be at least 1")]
    CpuCountTooSmall,
    #[error("defaults.memory_mb must be at least 128")]
    MemoryTooSmall,
    #[error("image must not be empty")]
    EmptyImage,
}

/// A single ingress mapping. The host listens on `listen_port` and the same
/// number is used for the host-socket port and the in-enclave loopback port.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Ingress {
    pub listen_port: u16,
}

/// Egress policy source patterns, kept as raw strings here. Pattern syntax is
/// checked by the policy compiler at startup so a bad pattern still fails
/// before any listener starts.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Egress {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct KmsProxy {
    pub listen_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_cpu_count")]
    pub cpu_count: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            cpu_count: default_cpu_count(),
            memory_mb: default_memory_mb(),
        }
    }
}

fn default_cpu_count() -> u32 {
    2
}
fn default_memory_mb() -> u64 {
    512
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Manifest {
    pub version: String,
    pub name: String,
    /// Source container reference; consumed by the image build pipeline only.
    pub image: String,
    #[serde(default)]
    pub ingress: Vec<Ingress>,
    #[serde(default)]
    pub egress: Egress,
    #[serde(default)]
    pub kms_proxy: Option<KmsProxy>,
    #[serde(default)]
    pub defaults: Defaults,
}

impl Manifest {
    pub fn from_yaml(yaml: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = serde_yaml::from_str(yaml)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    /// Structural validation. Every violation here is fatal at startup.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.version != SUPPORTED_VERSION {
            return Err(ManifestError::UnsupportedVersion(self.version.clone()));
        }
        if !is_dns1123_label(&self.name) {
            return Err(ManifestError::InvalidName(self.name.clone()));
        }
        if self.image.trim().is_empty() {
            return Err(ManifestError::EmptyImage);
        }

        let mut seen = HashSet::new();
        for entry in &self.ingress {
            if entry.listen_port == 0 {
                return Err(ManifestError::InvalidPort(entry.listen_port));
            }
            if entry.listen_port == EGRESS_PROXY_PORT {
                return Err(ManifestError::ReservedPort(entry.listen_port));
            }
            if !seen.insert(entry.listen_port) {
                return Err(ManifestError::DuplicateIngressPort(entry.listen_port));
            }
        }

        if let Some(kms) = &self.kms_proxy {
            if kms.listen_port == 0 {
                return Err(ManifestError::InvalidPort(kms.listen_port));
            }
            if kms.listen_port == EGRESS_PROXY_PORT {
                return Err(ManifestError::ReservedPort(kms.listen_port));
            }
            // Leaking the KMS proxy outside the enclave would nullify its
            // security value.
            if seen.contains(&kms.listen_port) {
                return Err(ManifestError::KmsPortExposed(kms.listen_port));
            }
        }

        if self.defaults.cpu_count < 1 {
            return Err(ManifestError::CpuCountTooSmall);
        }
        if self.defaults.memory_mb < 128 {
            return Err(ManifestError::MemoryTooSmall);
        }
        Ok(())
    }
}

/// A DNS-1123 label: lowercase alphanumerics and `-`, at most 63 characters,
/// not beginning or ending with `-`.
pub fn is_dns1123_label(s: &str) -> bool {
    if s.is_empty() || s.len() > 63 {
        return false;
    }
    let bytes = s.as_bytes();
    if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

/// A DNS-1123 subdomain: dot-separated labels, at most 253 characters total.
pub fn is_dns1123_subdomain(s: &str) -> bool {
    if s.is_empty() || s.len() > 253 {
        return false;
    }
    s.split('.').all(is_dns1123_label)
}
