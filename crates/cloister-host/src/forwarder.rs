//! Host-side plumbing around a running enclave: ingress forwarders, the
//! outside egress proxy with its transport bridge, and the application log
//! and exit-status drains.

use cloister_manifest::Manifest;
use cloister_proxy::{
    run_forwarder, DirectDialer, EgressPolicy, HttpProxy, TcpDialer, TransportDialer,
};
use cloister_transport::{Transport, APP_LOG_PORT, EGRESS_PORT, EXIT_STATUS_PORT};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum HostWiringError {
    #[error("failed to bind ingress listener on {host}:{port}")]
    IngressBind {
        host: IpAddr,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to bind the egress proxy on 127.0.0.1:{port}")]
    EgressBind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Transport(#[from] cloister_transport::TransportError),
}

/// Exit report sent by the inside supervisor over the status channel.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ExitReport {
    pub code: i32,
}

/// For each manifest ingress port, bind host TCP and forward into the
/// enclave over the transport. Bind failures are fatal at startup; they are
/// port conflicts the operator must resolve.
pub async fn spawn_ingress(
    manifest: &Manifest,
    transport: Transport,
    cid: u32,
    bind_host: IpAddr,
    cancel: &CancellationToken,
) -> Result<(), HostWiringError> {
    for entry in &manifest.ingress {
        let port = entry.listen_port;
        let listener =
            TcpListener::bind((bind_host, port))
                .await
                .map_err(|source| HostWiringError::IngressBind {
                    host: bind_host,
                    port,
                    source,
                })?;
        info!(%bind_host, port, "ingress forwarder listening");
        let dialer = Arc::new(TransportDialer::peer(transport, cid, u32::from(port)));
        tokio::spawn(run_forwarder("ingress", listener, dialer, cancel.clone()));
    }
    Ok(())
}

/// The outside egress proxy on parent loopback, plus the transport listener
/// that bridges enclave egress connections to it. The outside proxy carries
/// no policy: enforcement already happened inside the attested enclave.
pub async fn spawn_egress(
    transport: Transport,
    cancel: &CancellationToken,
) -> Result<(), HostWiringError> {
    let port = EGRESS_PORT as u16;
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|source| HostWiringError::EgressBind { port, source })?;
    info!(port, "outside egress proxy listening");
    let proxy = HttpProxy::new(Arc::new(EgressPolicy::allow_all()), Arc::new(DirectDialer));
    tokio::spawn(proxy.serve(listener, cancel.clone(), DRAIN_DEADLINE));

    let bridge = transport.listen(EGRESS_PORT).await?;
    let dialer = Arc::new(TcpDialer::loopback(port));
    tokio::spawn(run_forwarder("egress-bridge", bridge, dialer, cancel.clone()));
    Ok(())
}

/// Print enclave application output line by line. The inside supervisor
/// connects once per run and streams until the application exits.
pub async fn spawn_log_drain(
    transport: Transport,
    cancel: &CancellationToken,
) -> Result<(), HostWiringError> {
    let mut listener = transport.listen(APP_LOG_PORT).await?;
    let cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(error = %e, "log drain accept failed");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue;
                    }
                },
            };
            let mut lines = tokio::io::BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(target: "enclave-app", "{line}");
            }
        }
    });
    Ok(())
}

/// Listen for the one-line JSON exit report from the inside supervisor.
pub async fn spawn_status_listener(
    transport: Transport,
    cancel: &CancellationToken,
) -> Result<(), HostWiringError> {
    let mut listener = transport.listen(EXIT_STATUS_PORT).await?;
    let cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(error = %e, "status listener accept failed");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue;
                    }
                },
            };
            let mut line = String::new();
            let mut reader = tokio::io::BufReader::new(stream);
            if reader.read_line(&mut line).await.is_ok() {
                match serde_json::from_str::<ExitReport>(line.trim()) {
                    Ok(report) => info!(code = report.code, "enclave application exited"),
                    Err(_) if line.trim().is_empty() => {}
                    Err(e) => warn!(error = %e, "unparseable exit report"),
                }
            }
        }
    });
    Ok(())
}
