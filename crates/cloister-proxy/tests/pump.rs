//! End-to-end byte-stream properties of the pump.

use cloister_proxy::pump;
use rand::RngCore;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

/// A payload pushed through two chained pumps arrives intact, and EOF
/// propagates through both of them in both directions.
#[tokio::test]
async fn chained_pumps_preserve_stream() {
    for len in [0usize, 1, 4096, 1024 * 1024] {
        let payload = random_bytes(len);

        let (client, stage1_front) = duplex(16 * 1024);
        let (stage1_back, stage2_front) = duplex(16 * 1024);
        let (stage2_back, server) = duplex(16 * 1024);

        let pump1 = tokio::spawn(pump(stage1_front, stage1_back));
        let pump2 = tokio::spawn(pump(stage2_front, stage2_back));

        let expected = payload.clone();
        let server_task = tokio::spawn(async move {
            let (mut rd, mut wr) = tokio::io::split(server);
            let mut received = Vec::new();
            rd.read_to_end(&mut received).await.unwrap();
            assert_eq!(received, expected);
            wr.shutdown().await.unwrap();
        });

        let (mut client_rd, mut client_wr) = tokio::io::split(client);
        client_wr.write_all(&payload).await.unwrap();
        client_wr.shutdown().await.unwrap();

        // The reverse direction carries nothing, only EOF.
        let mut tail = Vec::new();
        client_rd.read_to_end(&mut tail).await.unwrap();
        assert!(tail.is_empty());

        server_task.await.unwrap();
        let s1 = pump1.await.unwrap().unwrap();
        let s2 = pump2.await.unwrap().unwrap();
        assert_eq!(s1.client_to_upstream, len as u64);
        assert_eq!(s2.client_to_upstream, len as u64);
        assert_eq!(s1.upstream_to_client, 0);
    }
}

/// A client that writes 10 MiB and half-closes still receives the full echo:
/// the pump must propagate the write shutdown instead of tearing the
/// connection down.
#[tokio::test]
async fn half_close_lets_echo_finish() {
    const LEN: usize = 10 * 1024 * 1024;

    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_port = echo.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = echo.accept().await.unwrap();
        let (mut rd, mut wr) = tokio::io::split(stream);
        tokio::io::copy(&mut rd, &mut wr).await.unwrap();
        wr.shutdown().await.unwrap();
    });

    let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let front_addr = front.local_addr().unwrap();
    let pump_task = tokio::spawn(async move {
        let (client, _) = front.accept().await.unwrap();
        let upstream = TcpStream::connect(("127.0.0.1", echo_port)).await.unwrap();
        pump(client, upstream).await
    });

    let payload = random_bytes(LEN);
    let mut client = TcpStream::connect(front_addr).await.unwrap();
    let (mut rd, mut wr) = client.split();

    let writer = async {
        wr.write_all(&payload).await.unwrap();
        wr.shutdown().await.unwrap();
    };
    let reader = async {
        let mut received = Vec::with_capacity(LEN);
        rd.read_to_end(&mut received).await.unwrap();
        received
    };
    let (_, received) = tokio::join!(writer, reader);
    assert_eq!(received, payload);

    let summary = pump_task.await.unwrap().unwrap();
    assert_eq!(summary.client_to_upstream, LEN as u64);
    assert_eq!(summary.upstream_to_client, LEN as u64);
}
