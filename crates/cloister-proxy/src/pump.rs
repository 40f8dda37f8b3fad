//! Bidirectional byte pump between two duplex streams.

use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Bytes moved in each direction by a completed [`pump`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpSummary {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Copy bytes in both directions between `client` and `upstream` until both
/// directions have terminated.
///
/// When one direction reaches EOF (or fails), the write side of its
/// destination is shut down so the peer observes the half-close. Without
/// that, an upstream waiting for end-of-request after the client has shut
/// down its write side would deadlock. EOF is not an error; the first hard
/// error from either direction is returned after both copies settle.
pub async fn pump<A, B>(client: A, upstream: B) -> io::Result<PumpSummary>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);

    let to_upstream = async {
        let copied = tokio::io::copy(&mut client_rd, &mut upstream_wr).await;
        let _ = upstream_wr.shutdown().await;
        copied
    };
    let to_client = async {
        let copied = tokio::io::copy(&mut upstream_rd, &mut client_wr).await;
        let _ = client_wr.shutdown().await;
        copied
    };

    let (to_upstream, to_client) = tokio::join!(to_upstream, to_client);
    Ok(PumpSummary {
        client_to_upstream: to_upstream?,
        upstream_to_client: to_client?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn echoes_and_propagates_eof() {
        // client <-> pump <-> upstream, where the upstream echoes.
        let (client_side, pump_client) = duplex(1024);
        let (pump_upstream, upstream_side) = duplex(1024);

        let pump_task = tokio::spawn(pump(pump_client, pump_upstream));
        let echo_task = tokio::spawn(async move {
            let (mut rd, mut wr) = tokio::io::split(upstream_side);
            tokio::io::copy(&mut rd, &mut wr).await.unwrap();
            wr.shutdown().await.unwrap();
        });

        let (mut rd, mut wr) = tokio::io::split(client_side);
        wr.write_all(b"ping").await.unwrap();
        wr.shutdown().await.unwrap();

        let mut out = Vec::new();
        rd.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"ping");

        let summary = pump_task.await.unwrap().unwrap();
        assert_eq!(summary.client_to_upstream, 4);
        assert_eq!(summary.upstream_to_client, 4);
        echo_task.await.unwrap();
    }
}
