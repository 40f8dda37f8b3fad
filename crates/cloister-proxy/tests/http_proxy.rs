//! Egress proxy scenarios: policy denial, CONNECT tunneling, graceful drain.

use cloister_manifest::Egress;
use cloister_proxy::{DirectDialer, EgressPolicy, HttpProxy};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::Response;
use hyper_util::rt::TokioIo;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

fn policy(allow: &[&str]) -> Arc<EgressPolicy> {
    let egress = Egress {
        allow: allow.iter().map(|s| s.to_string()).collect(),
        deny: Vec::new(),
    };
    Arc::new(EgressPolicy::compile(&egress, IpAddr::from([127, 0, 0, 1])).unwrap())
}

async fn start_proxy(policy: Arc<EgressPolicy>) -> (u16, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let cancel = CancellationToken::new();
    let proxy = HttpProxy::new(policy, Arc::new(DirectDialer));
    tokio::spawn(proxy.serve(listener, cancel.clone(), Duration::from_secs(5)));
    (port, cancel)
}

/// Serve `body` for every request, after an optional delay.
async fn start_upstream(delay: Duration, body: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let service = service_fn(move |_req| async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    port
}

#[tokio::test]
async fn denied_destination_gets_403() {
    let (proxy_port, _cancel) = start_proxy(policy(&["example.com"])).await;

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://127.0.0.1:{proxy_port}")).unwrap())
        .build()
        .unwrap();
    let response = client
        .get("http://other.invalid/")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn allowed_request_round_trips() {
    let upstream_port = start_upstream(Duration::ZERO, "Hello World!").await;
    let (proxy_port, _cancel) = start_proxy(policy(&["127.0.0.1"])).await;

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://127.0.0.1:{proxy_port}")).unwrap())
        .build()
        .unwrap();
    let response = client
        .get(format!("http://127.0.0.1:{upstream_port}/"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "Hello World!");
}

#[tokio::test]
async fn connect_tunnel_carries_raw_bytes() {
    // Raw TCP echo upstream.
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_port = echo.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = echo.accept().await.unwrap();
        let (mut rd, mut wr) = tokio::io::split(stream);
        tokio::io::copy(&mut rd, &mut wr).await.unwrap();
        wr.shutdown().await.unwrap();
    });

    let (proxy_port, _cancel) = start_proxy(policy(&["127.0.0.1"])).await;

    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    stream
        .write_all(
            format!("CONNECT 127.0.0.1:{echo_port} HTTP/1.1\r\nHost: 127.0.0.1:{echo_port}\r\n\r\n")
                .as_bytes(),
        )
        .await
        .unwrap();

    let mut response = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await.unwrap();
        response.push(byte[0]);
        if response.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    let head = String::from_utf8(response).unwrap();
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    stream.write_all(b"raw tunnel payload").await.unwrap();
    stream.shutdown().await.unwrap();
    let mut echoed = Vec::new();
    stream.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"raw tunnel payload");
}

#[tokio::test]
async fn connect_to_denied_destination_gets_403() {
    let (proxy_port, _cancel) = start_proxy(policy(&["example.com"])).await;

    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    stream
        .write_all(b"CONNECT 10.1.2.3:443 HTTP/1.1\r\nHost: 10.1.2.3:443\r\n\r\n")
        .await
        .unwrap();
    let mut head = vec![0u8; 12];
    stream.read_exact(&mut head).await.unwrap();
    assert_eq!(&head, b"HTTP/1.1 403");
}

/// A request already in flight when shutdown starts still completes, as long
/// as its remaining work fits inside the drain deadline.
#[tokio::test]
async fn graceful_drain_completes_in_flight_request() {
    let upstream_port = start_upstream(Duration::from_millis(300), "late but served").await;
    let (proxy_port, cancel) = start_proxy(policy(&["127.0.0.1"])).await;

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://127.0.0.1:{proxy_port}")).unwrap())
        .build()
        .unwrap();

    let request = tokio::spawn(async move {
        client
            .get(format!("http://127.0.0.1:{upstream_port}/"))
            .send()
            .await
            .unwrap()
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let response = tokio::time::timeout(Duration::from_secs(3), request)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "late but served");
}
