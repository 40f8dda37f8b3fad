//! Host-socket transport for enclave/parent communication.
//!
//! The real backend speaks AF_VSOCK. Development hosts without `/dev/vsock`
//! use the simulation backend, which maps every `(cid, port)` address onto
//! loopback TCP at `port + SIM_PORT_OFFSET`, so the whole stack runs in one
//! ordinary process.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_vsock::{VsockAddr, VsockListener, VsockStream};
use tracing::debug;

/// Well-known CID of the parent host.
pub const PARENT_CID: u32 = 3;
/// Wildcard CID used when listening inside the enclave.
pub const CID_ANY: u32 = 0xFFFF_FFFF;
/// Offset added to ports on the simulation backend to avoid colliding with
/// the loopback listeners the forwarded applications themselves bind.
pub const SIM_PORT_OFFSET: u16 = 3573;

/// Egress HTTP proxy port, identical on both sides of the transport.
pub const EGRESS_PORT: u32 = 3128;
/// Channel carrying the enclave application's stdout/stderr to the host.
pub const APP_LOG_PORT: u32 = 9010;
/// Channel carrying the enclave application's exit status to the host.
pub const EXIT_STATUS_PORT: u32 = 9011;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("vsock {op} failed for cid {cid} port {port}")]
    Vsock {
        op: &'static str,
        cid: u32,
        port: u32,
        #[source]
        source: io::Error,
    },
    #[error("simulated {op} failed for 127.0.0.1:{port}")]
    Sim {
        op: &'static str,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("port {0} cannot be mapped onto the simulated transport")]
    SimPortOutOfRange(u32),
}

/// Transport backend, selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Vsock,
    Sim,
}

impl Transport {
    /// Select the backend from `CLOISTER_TRANSPORT` (`vsock` | `sim`),
    /// defaulting to the real transport.
    pub fn from_env() -> Self {
        match std::env::var("CLOISTER_TRANSPORT").as_deref() {
            Ok("sim") => Transport::Sim,
            _ => Transport::Vsock,
        }
    }

    fn sim_port(port: u32) -> Result<u16, TransportError> {
        u16::try_from(port)
            .ok()
            .and_then(|p| p.checked_add(SIM_PORT_OFFSET))
            .ok_or(TransportError::SimPortOutOfRange(port))
    }

    /// Dial the parent host on `port`.
    pub async fn dial_parent(self, port: u32) -> Result<TransportStream, TransportError> {
        self.dial_peer(PARENT_CID, port).await
    }

    /// Dial the peer with context id `cid` on `port`. On the simulation
    /// backend the cid is ignored: everything lives on loopback.
    pub async fn dial_peer(self, cid: u32, port: u32) -> Result<TransportStream, TransportError> {
        match self {
            Transport::Vsock => {
                let stream = VsockStream::connect(VsockAddr::new(cid, port))
                    .await
                    .map_err(|source| TransportError::Vsock {
                        op: "connect",
                        cid,
                        port,
                        source,
                    })?;
                debug!(cid, port, "vsock connected");
                Ok(TransportStream::Vsock(stream))
            }
            Transport::Sim => {
                let port = Self::sim_port(port)?;
                let stream = TcpStream::connect(("127.0.0.1", port)).await.map_err(
                    |source| TransportError::Sim {
                        op: "connect",
                        port,
                        source,
                    },
                )?;
                Ok(TransportStream::Tcp(stream))
            }
        }
    }

    /// Listen on `port`. The enclave side listens with `CID_ANY`.
    pub async fn listen(self, port: u32) -> Result<TransportListener, TransportError> {
        match self {
            Transport::Vsock => {
                let listener = VsockListener::bind(VsockAddr::new(CID_ANY, port)).map_err(
                    |source| TransportError::Vsock {
                        op: "bind",
                        cid: CID_ANY,
                        port,
                        source,
                    },
                )?;
                debug!(port, "vsock listening");
                Ok(TransportListener::Vsock(listener))
            }
            Transport::Sim => {
                let port = Self::sim_port(port)?;
                let listener = TcpListener::bind(("127.0.0.1", port)).await.map_err(
                    |source| TransportError::Sim {
                        op: "bind",
                        port,
                        source,
                    },
                )?;
                Ok(TransportListener::Tcp(listener))
            }
        }
    }
}

pub enum TransportListener {
    Vsock(VsockListener),
    Tcp(TcpListener),
}

impl TransportListener {
    pub async fn accept(&mut self) -> io::Result<TransportStream> {
        match self {
            TransportListener::Vsock(l) => {
                let (stream, addr) = l.accept().await?;
                debug!(cid = addr.cid(), port = addr.port(), "vsock accepted");
                Ok(TransportStream::Vsock(stream))
            }
            TransportListener::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                Ok(TransportStream::Tcp(stream))
            }
        }
    }
}

/// A duplex byte stream over either backend.
pub enum TransportStream {
    Vsock(VsockStream),
    Tcp(TcpStream),
}

impl AsyncRead for TransportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportStream::Vsock(s) => Pin::new(s).poll_read(cx, buf),
            TransportStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TransportStream::Vsock(s) => Pin::new(s).poll_write(cx, buf),
            TransportStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportStream::Vsock(s) => Pin::new(s).poll_flush(cx),
            TransportStream::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportStream::Vsock(s) => Pin::new(s).poll_shutdown(cx),
            TransportStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
