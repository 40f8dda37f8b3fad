//! HTTP forward proxy.
//!
//! Exactly two shapes of traffic are supported: `CONNECT host:port`, which
//! becomes a raw tunnel through the [`pump`](crate::pump::pump) after a
//! policy check, and plain HTTP requests, which are round-tripped to the
//! upstream with hop-by-hop headers stripped. Everything else the enclave
//! does not need.

use crate::forward::BoxedStream;
use crate::policy::{EgressPolicy, Verdict};
use crate::pump::pump;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn status_response(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(full_body(message))
        .expect("static response")
}

/// Capability to open a connection to a named upstream. The enclave side
/// injects a dialer that tunnels through the parent; tests and the outside
/// proxy dial directly.
#[async_trait]
pub trait UpstreamDialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream>;
}

/// Plain TCP dialer.
pub struct DirectDialer;

#[async_trait]
impl UpstreamDialer for DirectDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Box::new(stream))
    }
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("request has no authority to dial")]
    MissingAuthority,
    #[error("failed to dial upstream")]
    Dial(#[source] io::Error),
    #[error("upstream round-trip failed")]
    Upstream(#[source] hyper::Error),
}

pub struct HttpProxy<D: ?Sized> {
    policy: Arc<EgressPolicy>,
    dialer: Arc<D>,
}

impl<D: UpstreamDialer + ?Sized + 'static> HttpProxy<D> {
    pub fn new(policy: Arc<EgressPolicy>, dialer: Arc<D>) -> Arc<Self> {
        Arc::new(Self { policy, dialer })
    }

    /// Serve until cancelled, then drain in-flight requests up to
    /// `drain_deadline`. Active CONNECT tunnels are not drained; they are
    /// aborted when the process exits.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
        drain_deadline: Duration,
    ) -> io::Result<()> {
        let proxy = self.clone();
        serve_connections(
            listener,
            move |req| {
                let proxy = proxy.clone();
                async move { Ok(proxy.handle(req).await) }
            },
            cancel,
            drain_deadline,
        )
        .await
    }

    pub async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        if req.method() == Method::CONNECT {
            self.handle_connect(req).await
        } else {
            self.handle_forward(req).await
        }
    }

    async fn handle_connect(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let Some(authority) = req.uri().authority().cloned() else {
            return status_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
        };
        let host = unbracket(authority.host());
        let port = authority.port_u16().unwrap_or(443);

        if self.policy.resolve(&host, port) == Verdict::Deny {
            info!(%host, port, "egress denied");
            return status_response(StatusCode::FORBIDDEN, "destination not permitted by policy");
        }

        let upstream = match self.dialer.dial(&host, port).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%host, port, error = %e, "tunnel dial failed");
                return status_response(StatusCode::BAD_GATEWAY, "upstream unavailable");
            }
        };

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let client = TokioIo::new(upgraded);
                    match pump(client, upstream).await {
                        Ok(summary) => debug!(
                            %host,
                            port,
                            rx = summary.client_to_upstream,
                            tx = summary.upstream_to_client,
                            "tunnel closed"
                        ),
                        Err(e) => debug!(%host, port, error = %e, "tunnel closed with error"),
                    }
                }
                Err(e) => warn!(%host, port, error = %e, "connect upgrade failed"),
            }
        });

        Response::builder()
            .status(StatusCode::OK)
            .body(empty_body())
            .expect("static response")
    }

    async fn handle_forward(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let Some((host, port)) = request_authority(&req) else {
            return status_response(StatusCode::BAD_REQUEST, "request target required");
        };
        if self.policy.resolve(&host, port) == Verdict::Deny {
            info!(%host, port, "egress denied");
            return status_response(StatusCode::FORBIDDEN, "destination not permitted by policy");
        }
        match forward_request(self.dialer.as_ref(), req).await {
            Ok(response) => response,
            Err(ForwardError::MissingAuthority) => {
                status_response(StatusCode::BAD_REQUEST, "request target required")
            }
            Err(e) => {
                warn!(%host, port, error = %e, "forward failed");
                status_response(StatusCode::BAD_GATEWAY, "upstream unavailable")
            }
        }
    }
}

/// Round-trip `req` to the authority it names, via `dialer`. Policy decisions
/// belong to the caller; this only moves bytes.
pub async fn forward_request<D, B>(
    dialer: &D,
    req: Request<B>,
) -> Result<Response<ProxyBody>, ForwardError>
where
    D: UpstreamDialer + ?Sized,
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (host, port) = request_authority(&req).ok_or(ForwardError::MissingAuthority)?;
    let stream = dialer.dial(&host, port).await.map_err(ForwardError::Dial)?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(ForwardError::Upstream)?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "upstream connection ended");
        }
    });

    let outbound = to_origin_form(req, &host, port);
    let response = sender
        .send_request(outbound)
        .await
        .map_err(ForwardError::Upstream)?;

    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Ok(Response::from_parts(parts, body.boxed()))
}

/// The authority a request targets: the absolute-form URI if present,
/// otherwise the `Host` header. Ports default per scheme.
pub fn request_authority<B>(req: &Request<B>) -> Option<(String, u16)> {
    if let Some(host) = req.uri().host() {
        let port = req
            .uri()
            .port_u16()
            .unwrap_or_else(|| default_port(req.uri().scheme_str()));
        return Some((unbracket(host), port));
    }
    let value = req.headers().get(HOST)?.to_str().ok()?;
    let authority: http::uri::Authority = value.parse().ok()?;
    let port = authority.port_u16().unwrap_or(80);
    Some((unbracket(authority.host()), port))
}

fn default_port(scheme: Option<&str>) -> u16 {
    match scheme {
        Some("https") => 443,
        _ => 80,
    }
}

fn unbracket(host: &str) -> String {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .to_string()
}

/// Rewrite a proxied request into origin form for the upstream: relative
/// request target, hop-by-hop headers removed, `Host` present.
fn to_origin_form<B>(req: Request<B>, host: &str, port: u16) -> Request<B> {
    let (mut parts, body) = req.into_parts();
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    parts.uri = target.parse().unwrap_or_else(|_| Uri::from_static("/"));
    parts.version = hyper::Version::HTTP_11;
    strip_hop_by_hop(&mut parts.headers);
    if !parts.headers.contains_key(HOST) {
        let value = if port == 80 {
            host.to_string()
        } else {
            format!("{host}:{port}")
        };
        if let Ok(value) = HeaderValue::try_from(value) {
            parts.headers.insert(HOST, value);
        }
    }
    Request::from_parts(parts, body)
}

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let mut named: Vec<HeaderName> = Vec::new();
    for value in headers.get_all(CONNECTION) {
        if let Ok(list) = value.to_str() {
            for token in list.split(',') {
                if let Ok(name) = token.trim().parse::<HeaderName>() {
                    named.push(name);
                }
            }
        }
    }
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Accept loop shared by the egress proxy and the KMS proxy: HTTP/1.1 with
/// upgrade support, graceful drain on cancellation bounded by
/// `drain_deadline`.
pub async fn serve_connections<F, Fut>(
    listener: TcpListener,
    handler: F,
    cancel: CancellationToken,
    drain_deadline: Duration,
) -> io::Result<()>
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<ProxyBody>, hyper::Error>> + Send + 'static,
{
    // `hyper_util::server::graceful::GracefulShutdown` does not implement its
    // (sealed) `GracefulConnection` trait for upgrade-capable connections, so
    // the drain is wired up by hand here using the same watch-channel
    // approach, driving `UpgradeableConnection::graceful_shutdown` directly.
    let (shutdown_tx, _) = watch::channel(());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "proxy connection accepted");
                    let handler = handler.clone();
                    let mut conn = Box::pin(
                        hyper::server::conn::http1::Builder::new()
                            .serve_connection(
                                TokioIo::new(stream),
                                service_fn(move |req| handler(req)),
                            )
                            .with_upgrades(),
                    );
                    let mut shutdown_rx = shutdown_tx.subscribe();
                    tokio::spawn(async move {
                        tokio::select! {
                            res = conn.as_mut() => {
                                if let Err(e) = res {
                                    debug!(error = %e, "proxy connection error");
                                }
                            }
                            _ = shutdown_rx.changed() => {
                                conn.as_mut().graceful_shutdown();
                                if let Err(e) = conn.as_mut().await {
                                    debug!(error = %e, "proxy connection error");
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "proxy accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }

    // Stop accepting before draining what is in flight.
    drop(listener);
    let drained = async {
        let _ = shutdown_tx.send(());
        shutdown_tx.closed().await;
    };
    tokio::select! {
        _ = drained => info!("proxy drained"),
        _ = tokio::time::sleep(drain_deadline) => info!("proxy drain deadline reached"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_hop_by_hop_and_connection_named() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("close, x-custom-hop"));
        headers.insert("x-custom-hop", HeaderValue::from_static("1"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-app", HeaderValue::from_static("keep"));
        strip_hop_by_hop(&mut headers);
        assert!(headers.get("x-custom-hop").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get(CONNECTION).is_none());
        assert_eq!(headers.get("x-app").unwrap(), "keep");
    }

    #[test]
    fn authority_from_absolute_uri() {
        let req = Request::builder()
            .uri("https://example.com/path")
            .body(())
            .unwrap();
        assert_eq!(
            request_authority(&req),
            Some(("example.com".to_string(), 443))
        );

        let req = Request::builder()
            .uri("http://example.com:8080/path")
            .body(())
            .unwrap();
        assert_eq!(
            request_authority(&req),
            Some(("example.com".to_string(), 8080))
        );
    }

    #[test]
    fn authority_from_host_header() {
        let req = Request::builder()
            .uri("/path")
            .header(HOST, "example.com:81")
            .body(())
            .unwrap();
        assert_eq!(
            request_authority(&req),
            Some(("example.com".to_string(), 81))
        );

        let req = Request::builder().uri("/path").body(()).unwrap();
        assert_eq!(request_authority(&req), None);
    }

    #[test]
    fn origin_form_rewrites_target_and_host() {
        let req = Request::builder()
            .uri("http://example.com:8080/a/b?c=1")
            .header("connection", "close")
            .body(())
            .unwrap();
        let out = to_origin_form(req, "example.com", 8080);
        assert_eq!(out.uri(), "/a/b?c=1");
        assert_eq!(out.headers().get(HOST).unwrap(), "example.com:8080");
        assert!(out.headers().get("connection").is_none());
    }
}
