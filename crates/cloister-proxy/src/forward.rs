//! Accept-loop stream forwarder.
//!
//! The forwarder accepts connections from an injected listener and, for each
//! one, opens a downstream connection through an injected [`Dialer`] and runs
//! the [`pump`](crate::pump::pump). This is the common building block for all
//! straight TCP forwarding on both sides of the transport.

use crate::pump::pump;
use async_trait::async_trait;
use cloister_transport::{Transport, TransportListener};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Object-safe duplex stream.
pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Duplex for T {}

pub type BoxedStream = Box<dyn Duplex>;

/// Capability to open the downstream side of a forwarded connection.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> io::Result<BoxedStream>;
}

/// Dials a fixed TCP address; used inside the enclave to reach the user
/// application on loopback, and outside to reach local proxy listeners.
pub struct TcpDialer {
    addr: SocketAddr,
}

impl TcpDialer {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub fn loopback(port: u16) -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(self.addr).await?;
        Ok(Box::new(stream))
    }
}

/// Dials a fixed `(cid, port)` over the host-socket transport.
pub struct TransportDialer {
    transport: Transport,
    cid: u32,
    port: u32,
}

impl TransportDialer {
    pub fn peer(transport: Transport, cid: u32, port: u32) -> Self {
        Self {
            transport,
            cid,
            port,
        }
    }

    pub fn parent(transport: Transport, port: u32) -> Self {
        Self::peer(transport, cloister_transport::PARENT_CID, port)
    }
}

#[async_trait]
impl Dialer for TransportDialer {
    async fn dial(&self) -> io::Result<BoxedStream> {
        let stream = self
            .transport
            .dial_peer(self.cid, self.port)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e))?;
        Ok(Box::new(stream))
    }
}

/// Connection source the forwarder accepts from.
#[async_trait]
pub trait Listener: Send {
    async fn accept(&mut self) -> io::Result<BoxedStream>;
}

#[async_trait]
impl Listener for TransportListener {
    async fn accept(&mut self) -> io::Result<BoxedStream> {
        let stream = TransportListener::accept(self).await?;
        Ok(Box::new(stream))
    }
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&mut self) -> io::Result<BoxedStream> {
        let (stream, peer) = TcpListener::accept(self).await?;
        debug!(%peer, "tcp accepted");
        Ok(Box::new(stream))
    }
}

const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Run the accept loop until cancelled.
///
/// Per-connection failures are logged and do not stop the loop. Accept
/// failures back off with bounded doubling instead of tearing the listener
/// down.
pub async fn run_forwarder<L, D>(
    name: &'static str,
    mut listener: L,
    dialer: Arc<D>,
    cancel: CancellationToken,
) where
    L: Listener,
    D: Dialer + ?Sized + 'static,
{
    let mut backoff = BACKOFF_INITIAL;
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => {
                info!(name, "forwarder stopping");
                return;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(stream) => {
                backoff = BACKOFF_INITIAL;
                let dialer = dialer.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = relay(name, stream, dialer, cancel).await {
                        warn!(name, error = %e, "connection closed with error");
                    }
                });
            }
            Err(e) => {
                warn!(name, error = %e, "accept failed, backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        }
    }
}

async fn relay<D>(
    name: &'static str,
    client: BoxedStream,
    dialer: Arc<D>,
    cancel: CancellationToken,
) -> io::Result<()>
where
    D: Dialer + ?Sized,
{
    let upstream = dialer.dial().await?;
    tokio::select! {
        _ = cancel.cancelled() => {
            debug!(name, "connection aborted by shutdown");
            Ok(())
        }
        result = pump(client, upstream) => {
            let summary = result?;
            debug!(
                name,
                rx = summary.client_to_upstream,
                tx = summary.upstream_to_client,
                "connection finished"
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn forwards_to_dialed_upstream() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = upstream.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    stream.read_to_end(&mut buf).await.unwrap();
                    stream.write_all(&buf).await.unwrap();
                });
            }
        });

        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_forwarder(
            "test",
            front,
            Arc::new(TcpDialer::loopback(upstream_port)),
            cancel.clone(),
        ));

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        client.write_all(b"forwarded").await.unwrap();
        client.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"forwarded");

        cancel.cancel();
        task.await.unwrap();
    }
}
