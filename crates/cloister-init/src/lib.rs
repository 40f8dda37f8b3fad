//! Inside supervisor for cloister enclaves.
//!
//! Runs as the image's init process: brings up loopback, seeds the system
//! entropy pool from the attestation device, starts the KMS and egress
//! proxies and the ingress forwarders, then hands control to the user's
//! original entrypoint and reports its exit to the host.

pub mod child;
pub mod forwarder;
pub mod system;

use cloister_kms_proxy::KmsProxyError;
use cloister_nsm::NsmError;
use cloister_proxy::PolicyError;
use cloister_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to bring loopback up")]
    Loopback(#[source] std::io::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Nsm(#[from] NsmError),
    #[error(transparent)]
    KmsProxy(#[from] KmsProxyError),
    #[error("kms proxy upstream is not configured; set AWS_REGION or CLOISTER_KMS_UPSTREAM")]
    KmsEndpoint,
    #[error("failed to bind {what} listener on 127.0.0.1:{port}")]
    Bind {
        what: &'static str,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read entrypoint {path}")]
    EntrypointRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid entrypoint {path}")]
    EntrypointParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("entrypoint argv must not be empty")]
    EmptyEntrypoint,
    #[error("failed to spawn user entrypoint {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}
