//! Attestation-injecting KMS proxy.
//!
//! An HTTP forward proxy specialized for the KMS endpoint: requests for the
//! recipient-capable actions get a fresh attestation document injected as
//! `Recipient`, are re-signed over the mutated body, and the
//! `CiphertextForRecipient` coming back is unwrapped with the enclave's
//! ephemeral private key before the response reaches the caller. Everything
//! else passes through.

pub mod envelope;
pub mod sign;

use crate::envelope::{unwrap_enveloped_data, EnvelopeError};
use crate::sign::{RequestSigner, SignError};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use bytes::Bytes;
use cloister_nsm::{AttestationProvider, EphemeralKey};
use cloister_proxy::{
    full_body, serve_connections, status_response, strip_hop_by_hop, BoxedStream, ProxyBody,
    UpstreamDialer,
};
use http::header::{CONTENT_LENGTH, HOST};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rand::RngCore;
use rustls::pki_types::ServerName;
use serde_json::Value;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// KMS actions that support recipient-encrypted responses. Adding an action
/// here is sufficient as long as it follows the same `Recipient` pattern.
pub const INTERCEPTED_ACTIONS: [&str; 3] = ["Decrypt", "GenerateDataKey", "GenerateRandom"];

const RECIPIENT_FIELD: &str = "Recipient";
const CIPHERTEXT_FOR_RECIPIENT: &str = "CiphertextForRecipient";
/// All intercepted actions return the unwrapped bytes as `Plaintext` on the
/// wire.
const PLAINTEXT_FIELD: &str = "Plaintext";
const KEY_ENCRYPTION_ALGORITHM: &str = "RSAES_OAEP_SHA_256";

#[derive(Debug, Error)]
pub enum KmsProxyError {
    #[error("bad KMS request: {0}")]
    BadRequest(&'static str),
    #[error("request already carries a Recipient")]
    RecipientConflict,
    #[error("attestation unavailable: {0}")]
    AttestationUnavailable(String),
    #[error("failed to dial KMS upstream")]
    Dial(#[source] io::Error),
    #[error("KMS upstream round-trip failed")]
    Upstream(#[source] hyper::Error),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Sign(#[from] SignError),
    #[error("TLS setup failed: {0}")]
    Tls(String),
}

impl KmsProxyError {
    fn into_response(self) -> Response<ProxyBody> {
        let (status, message) = match &self {
            KmsProxyError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad KMS request"),
            KmsProxyError::RecipientConflict => {
                (StatusCode::BAD_REQUEST, "request already carries a Recipient")
            }
            KmsProxyError::AttestationUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "attestation unavailable")
            }
            KmsProxyError::Dial(_) | KmsProxyError::Upstream(_) => {
                (StatusCode::BAD_GATEWAY, "KMS upstream unavailable")
            }
            // Never describe what failed to decrypt.
            KmsProxyError::Envelope(_) | KmsProxyError::Sign(_) | KmsProxyError::Tls(_) => {
                (StatusCode::BAD_GATEWAY, "KMS response could not be processed")
            }
        };
        warn!(error = %self, "kms proxy request failed");
        status_response(status, message)
    }
}

/// Where intercepted traffic is forwarded.
#[derive(Debug, Clone)]
pub struct KmsEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl KmsEndpoint {
    pub fn for_region(region: &str) -> Self {
        Self {
            host: format!("kms.{region}.amazonaws.com"),
            port: 443,
            tls: true,
        }
    }

    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
        }
    }

    /// `CLOISTER_KMS_UPSTREAM` (an `http://` or `https://` URL) overrides the
    /// regional endpoint; otherwise `AWS_REGION` selects it.
    pub fn from_env() -> Option<Self> {
        if let Ok(raw) = std::env::var("CLOISTER_KMS_UPSTREAM") {
            let uri: Uri = raw.parse().ok()?;
            let tls = uri.scheme_str() == Some("https");
            let host = uri.host()?.to_string();
            let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
            return Some(Self { host, port, tls });
        }
        std::env::var("AWS_REGION")
            .ok()
            .map(|region| Self::for_region(&region))
    }

    fn host_header(&self) -> String {
        let default = if self.tls { 443 } else { 80 };
        if self.port == default {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

pub struct KmsProxy {
    provider: AttestationProvider,
    keys: Arc<EphemeralKey>,
    dialer: Arc<dyn UpstreamDialer>,
    endpoint: KmsEndpoint,
    signer: Option<RequestSigner>,
    tls: Option<TlsConnector>,
}

impl KmsProxy {
    pub fn new(
        provider: AttestationProvider,
        keys: Arc<EphemeralKey>,
        dialer: Arc<dyn UpstreamDialer>,
        endpoint: KmsEndpoint,
        signer: Option<RequestSigner>,
    ) -> Result<Arc<Self>, KmsProxyError> {
        let tls = if endpoint.tls {
            Some(build_tls_connector()?)
        } else {
            None
        };
        Ok(Arc::new(Self {
            provider,
            keys,
            dialer,
            endpoint,
            signer,
            tls,
        }))
    }

    /// Serve until cancelled; drains like the generic egress proxy.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
        drain_deadline: Duration,
    ) -> io::Result<()> {
        info!(
            upstream = %self.endpoint.host,
            port = self.endpoint.port,
            "kms proxy serving"
        );
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
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(error = %e, "failed to read kms request body");
                return status_response(StatusCode::BAD_REQUEST, "failed to read request body");
            }
        };
        match self.process(parts, body).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        }
    }

    async fn process(
        &self,
        parts: http::request::Parts,
        body: Bytes,
    ) -> Result<Response<ProxyBody>, KmsProxyError> {
        match detect_action(&parts, &body) {
            Some(action) if INTERCEPTED_ACTIONS.contains(&action.as_str()) => {
                debug!(action, "intercepting kms action");
                self.intercept(parts, body).await
            }
            action => {
                debug!(?action, "passing kms request through");
                self.forward(parts, body).await
            }
        }
    }

    /// Inject the recipient, forward, unwrap the recipient ciphertext.
    async fn intercept(
        &self,
        parts: http::request::Parts,
        body: Bytes,
    ) -> Result<Response<ProxyBody>, KmsProxyError> {
        let mut json: Value = serde_json::from_slice(&body)
            .map_err(|_| KmsProxyError::BadRequest("body is not JSON"))?;
        let object = json
            .as_object_mut()
            .ok_or(KmsProxyError::BadRequest("body is not a JSON object"))?;
        if object.contains_key(RECIPIENT_FIELD) {
            return Err(KmsProxyError::RecipientConflict);
        }

        let material = self
            .keys
            .material()
            .map_err(|e| KmsProxyError::AttestationUnavailable(e.to_string()))?;
        let mut nonce = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);
        let document = self
            .provider
            .attest(Some(nonce), None, Some(material.public_spki_der().to_vec()))
            .await
            .map_err(|e| KmsProxyError::AttestationUnavailable(e.to_string()))?;

        object.insert(
            RECIPIENT_FIELD.to_string(),
            serde_json::json!({
                "AttestationDocument": B64.encode(&document),
                "KeyEncryptionAlgorithm": KEY_ENCRYPTION_ALGORITHM,
            }),
        );
        // Fresh buffer; the original body is left untouched for any error
        // path that still refers to it.
        let mutated = Bytes::from(
            serde_json::to_vec(&json).map_err(|_| KmsProxyError::BadRequest("unserializable"))?,
        );

        let response = self.forward(parts, mutated).await?;
        self.unwrap_response(response).await
    }

    /// Re-target the request at the configured endpoint and round-trip it.
    /// Bodies are always re-signed when credentials are available, because
    /// the `Host` header changes even when the body does not.
    async fn forward(
        &self,
        parts: http::request::Parts,
        body: Bytes,
    ) -> Result<Response<ProxyBody>, KmsProxyError> {
        let target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let mut request = Request::builder()
            .method(parts.method.clone())
            .uri(target)
            .body(Full::new(body.clone()))
            .map_err(|_| KmsProxyError::BadRequest("unbuildable request"))?;

        let headers = request.headers_mut();
        for (name, value) in parts.headers.iter() {
            headers.insert(name, value.clone());
        }
        strip_hop_by_hop(headers);
        headers.remove(CONTENT_LENGTH);
        let host_value = self.endpoint.host_header();
        headers.insert(
            HOST,
            host_value
                .parse()
                .map_err(|_| KmsProxyError::BadRequest("invalid upstream host"))?,
        );
        if let Some(signer) = &self.signer {
            signer.resign(&mut request, &body)?;
        }

        let stream = self
            .dialer
            .dial(&self.endpoint.host, self.endpoint.port)
            .await
            .map_err(KmsProxyError::Dial)?;
        let stream: BoxedStream = match &self.tls {
            Some(connector) => {
                let name = ServerName::try_from(self.endpoint.host.clone())
                    .map_err(|e| KmsProxyError::Tls(e.to_string()))?;
                Box::new(
                    connector
                        .connect(name, stream)
                        .await
                        .map_err(KmsProxyError::Dial)?,
                )
            }
            None => stream,
        };

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(KmsProxyError::Upstream)?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "kms upstream connection ended");
            }
        });
        let response = sender
            .send_request(request)
            .await
            .map_err(KmsProxyError::Upstream)?;

        let (mut rparts, rbody) = response.into_parts();
        strip_hop_by_hop(&mut rparts.headers);
        Ok(Response::from_parts(rparts, rbody.boxed()))
    }

    /// Replace `CiphertextForRecipient` with the decrypted plaintext.
    /// Responses without the field, non-2xx responses, and non-JSON bodies
    /// pass through untouched.
    async fn unwrap_response(
        &self,
        response: Response<ProxyBody>,
    ) -> Result<Response<ProxyBody>, KmsProxyError> {
        if !response.status().is_success() {
            return Ok(response);
        }
        let (mut parts, body) = response.into_parts();
        let bytes = body
            .collect()
            .await
            .map_err(KmsProxyError::Upstream)?
            .to_bytes();

        let mut json: Value = match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(_) => {
                return Ok(Response::from_parts(parts, full_body(bytes)));
            }
        };
        let Some(object) = json.as_object_mut() else {
            return Ok(Response::from_parts(parts, full_body(bytes)));
        };
        let Some(wrapped) = object.remove(CIPHERTEXT_FOR_RECIPIENT) else {
            return Ok(Response::from_parts(parts, full_body(bytes)));
        };

        let wrapped = wrapped
            .as_str()
            .ok_or(EnvelopeError::Decode("recipient ciphertext is not a string"))?;
        let blob = B64
            .decode(wrapped)
            .map_err(|_| EnvelopeError::Decode("recipient ciphertext is not base64"))?;
        let material = self
            .keys
            .material()
            .map_err(|e| KmsProxyError::AttestationUnavailable(e.to_string()))?;
        let plaintext = Zeroizing::new(unwrap_enveloped_data(&blob, material.private())?);

        object.insert(
            PLAINTEXT_FIELD.to_string(),
            Value::String(B64.encode(plaintext.as_slice())),
        );
        parts.headers.remove(CONTENT_LENGTH);
        let rewritten = serde_json::to_vec(&json)
            .map_err(|_| EnvelopeError::Decode("rewritten response unserializable"))?;
        Ok(Response::from_parts(parts, full_body(rewritten)))
    }
}

/// The KMS action named by a request: the body's `Action` field when
/// present, else the trailing segment of `X-Amz-Target` (the form the AWS
/// SDKs send).
fn detect_action(parts: &http::request::Parts, body: &[u8]) -> Option<String> {
    if let Ok(json) = serde_json::from_slice::<Value>(body) {
        if let Some(action) = json.get("Action").and_then(Value::as_str) {
            return Some(action.to_string());
        }
    }
    let target = parts.headers.get("x-amz-target")?.to_str().ok()?;
    target.rsplit('.').next().map(str::to_string)
}

fn build_tls_connector() -> Result<TlsConnector, KmsProxyError> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| KmsProxyError::Tls(e.to_string()))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_from_body_wins_over_header() {
        let parts = Request::builder()
            .header("x-amz-target", "TrentService.GenerateDataKey")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        let action = detect_action(&parts, br#"{"Action":"Decrypt"}"#);
        assert_eq!(action.as_deref(), Some("Decrypt"));

        let action = detect_action(&parts, br#"{"KeyId":"k"}"#);
        assert_eq!(action.as_deref(), Some("GenerateDataKey"));
    }

    #[test]
    fn endpoint_host_header_elides_default_port() {
        assert_eq!(
            KmsEndpoint::for_region("us-east-1").host_header(),
            "kms.us-east-1.amazonaws.com"
        );
        assert_eq!(
            KmsEndpoint::plain("127.0.0.1", 9321).host_header(),
            "127.0.0.1:9321"
        );
    }
}
