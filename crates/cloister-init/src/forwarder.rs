//! Enclave-side forwarders and proxies.

use crate::SupervisorError;
use async_trait::async_trait;
use cloister_kms_proxy::{KmsEndpoint, KmsProxy};
use cloister_manifest::Manifest;
use cloister_nsm::{AttestationProvider, EphemeralKey};
use cloister_proxy::{
    run_forwarder, BoxedStream, EgressPolicy, HttpProxy, TcpDialer, UpstreamDialer,
};
use cloister_transport::{Transport, EGRESS_PORT};
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// For each manifest ingress port, accept host-socket connections and hand
/// them to the user's listener on loopback.
pub async fn spawn_ingress(
    manifest: &Manifest,
    transport: Transport,
    cancel: &CancellationToken,
) -> Result<(), SupervisorError> {
    for entry in &manifest.ingress {
        let port = entry.listen_port;
        let listener = transport.listen(u32::from(port)).await?;
        info!(port, "enclave ingress forwarder listening");
        let dialer = Arc::new(TcpDialer::loopback(port));
        tokio::spawn(run_forwarder(
            "enclave-ingress",
            listener,
            dialer,
            cancel.clone(),
        ));
    }
    Ok(())
}

/// Upstream dialer that reaches the outside world through the parent's
/// egress proxy: dial the parent on the egress port and establish a
/// `CONNECT` tunnel to the destination.
pub struct ParentProxyDialer {
    transport: Transport,
}

impl ParentProxyDialer {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl UpstreamDialer for ParentProxyDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let mut stream = self
            .transport
            .dial_parent(EGRESS_PORT)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e))?;

        let authority = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        stream
            .write_all(
                format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n").as_bytes(),
            )
            .await?;

        // Read the response head; the tunnel begins right after it.
        let mut head = Vec::with_capacity(128);
        loop {
            let mut byte = [0u8; 1];
            if stream.read_exact(&mut byte).await.is_err() {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "egress proxy closed during CONNECT",
                ));
            }
            head.push(byte[0]);
            if head.ends_with(b"\r\n\r\n") {
                break;
            }
            if head.len() > 8 * 1024 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "oversized CONNECT response",
                ));
            }
        }
        let status_ok = head
            .split(|b| *b == b' ')
            .nth(1)
            .is_some_and(|code| code == b"200");
        if !status_ok {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "egress proxy refused CONNECT",
            ));
        }
        Ok(Box::new(stream))
    }
}

/// The in-enclave egress HTTP proxy, bound on loopback with the manifest's
/// policy compiled in, dialing out through the parent. On the real transport
/// a companion host-socket listener on the same port tunnels into it; the
/// simulation backend shares loopback with the parent side and skips the
/// companion.
pub async fn spawn_egress_proxy(
    manifest: &Manifest,
    transport: Transport,
    listen_port: u16,
    cancel: &CancellationToken,
) -> Result<(), SupervisorError> {
    let policy = EgressPolicy::compile(&manifest.egress, IpAddr::from([127, 0, 0, 1]))?;
    let listener = TcpListener::bind(("127.0.0.1", listen_port))
        .await
        .map_err(|source| SupervisorError::Bind {
            what: "egress proxy",
            port: listen_port,
            source,
        })?;
    info!(port = listen_port, "egress proxy listening");

    let proxy = HttpProxy::new(
        Arc::new(policy),
        Arc::new(ParentProxyDialer::new(transport)),
    );
    tokio::spawn(proxy.serve(listener, cancel.clone(), DRAIN_DEADLINE));

    if transport == Transport::Vsock {
        let companion = transport.listen(EGRESS_PORT).await?;
        let dialer = Arc::new(TcpDialer::loopback(listen_port));
        tokio::spawn(run_forwarder(
            "egress-companion",
            companion,
            dialer,
            cancel.clone(),
        ));
    }
    Ok(())
}

/// The KMS attestation proxy, when the manifest asks for one. Returns the
/// loopback port the user application should be pointed at.
pub async fn spawn_kms_proxy(
    manifest: &Manifest,
    transport: Transport,
    provider: AttestationProvider,
    keys: Arc<EphemeralKey>,
    cancel: &CancellationToken,
) -> Result<Option<u16>, SupervisorError> {
    let Some(kms) = &manifest.kms_proxy else {
        return Ok(None);
    };
    let endpoint = KmsEndpoint::from_env().ok_or(SupervisorError::KmsEndpoint)?;
    let signer = cloister_kms_proxy::sign::RequestSigner::from_env();

    let listener = TcpListener::bind(("127.0.0.1", kms.listen_port))
        .await
        .map_err(|source| SupervisorError::Bind {
            what: "kms proxy",
            port: kms.listen_port,
            source,
        })?;
    info!(port = kms.listen_port, "kms proxy listening");

    let proxy = KmsProxy::new(
        provider,
        keys,
        Arc::new(ParentProxyDialer::new(transport)),
        endpoint,
        signer,
    )?;
    tokio::spawn(proxy.serve(listener, cancel.clone(), DRAIN_DEADLINE));
    Ok(Some(kms.listen_port))
}
