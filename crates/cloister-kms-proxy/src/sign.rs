//! SigV4 re-signing for mutated KMS requests.
//!
//! Injecting `Recipient` changes the body bytes, which invalidates the
//! caller's signature. The signature is recomputed from the final byte
//! representation only; the mutated body is a fresh buffer that never aliases
//! the pass-through path.

use aws_credential_types::Credentials;
use aws_sigv4::http_request::{sign, SignableBody, SignableRequest, SigningSettings};
use aws_sigv4::sign::v4;
use http::header::AUTHORIZATION;
use http::Request;
use std::time::SystemTime;
use thiserror::Error;

const SIGNING_SERVICE: &str = "kms";

#[derive(Debug, Error)]
pub enum SignError {
    #[error("failed to build signing parameters: {0}")]
    Params(String),
    #[error("request is not signable: {0}")]
    Signable(String),
    #[error("signing failed: {0}")]
    Sign(String),
}

pub struct RequestSigner {
    region: String,
    credentials: Credentials,
}

impl RequestSigner {
    pub fn new(region: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            region: region.into(),
            credentials,
        }
    }

    /// Build a signer from the standard AWS environment variables. Returns
    /// `None` when no credentials are present, in which case requests are
    /// forwarded with their original signature.
    pub fn from_env() -> Option<Self> {
        let region = std::env::var("AWS_REGION").ok()?;
        let access_key = std::env::var("AWS_ACCESS_KEY_ID").ok()?;
        let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok()?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();
        Some(Self::new(
            region,
            Credentials::new(access_key, secret_key, session_token, None, "environment"),
        ))
    }

    /// Replace the request's signature headers with a fresh SigV4 signature
    /// over `body`. The `Host` header must already name the real upstream.
    pub fn resign<B>(&self, request: &mut Request<B>, body: &[u8]) -> Result<(), SignError> {
        // Stale signature material must not enter the canonical request.
        request.headers_mut().remove(AUTHORIZATION);
        request.headers_mut().remove("x-amz-date");
        request.headers_mut().remove("x-amz-security-token");

        let identity = self.credentials.clone().into();
        let params: aws_sigv4::http_request::SigningParams<'_> = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name(SIGNING_SERVICE)
            .time(SystemTime::now())
            .settings(SigningSettings::default())
            .build()
            .map_err(|e| SignError::Params(e.to_string()))?
            .into();

        let headers = request
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str(),
                    std::str::from_utf8(value.as_bytes()).unwrap_or(""),
                )
            })
            .collect::<Vec<_>>();
        let signable = SignableRequest::new(
            request.method().as_str(),
            request.uri().to_string(),
            headers.into_iter(),
            SignableBody::Bytes(body),
        )
        .map_err(|e| SignError::Signable(e.to_string()))?;

        let (instructions, _signature) = sign(signable, &params)
            .map_err(|e| SignError::Sign(e.to_string()))?
            .into_parts();
        instructions.apply_to_request_http1x(request);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HOST;

    fn signer() -> RequestSigner {
        RequestSigner::new(
            "us-east-1",
            Credentials::new("AKIDEXAMPLE", "secret", None, None, "test"),
        )
    }

    #[test]
    fn resign_sets_signature_headers() {
        let body = br#"{"Action":"Decrypt"}"#;
        let mut request = Request::builder()
            .method("POST")
            .uri("/")
            .header(HOST, "kms.us-east-1.amazonaws.com")
            .header("content-type", "application/x-amz-json-1.1")
            .body(())
            .unwrap();
        signer().resign(&mut request, body).unwrap();

        let auth = request.headers().get(AUTHORIZATION).unwrap();
        let auth = auth.to_str().unwrap();
        assert!(auth.starts_with("AWS4-HMAC-SHA256"));
        assert!(auth.contains("us-east-1/kms/aws4_request"));
        assert!(request.headers().contains_key("x-amz-date"));
    }

    #[test]
    fn resign_replaces_stale_signature() {
        let mut request = Request::builder()
            .method("POST")
            .uri("/")
            .header(HOST, "kms.us-east-1.amazonaws.com")
            .header(AUTHORIZATION, "AWS4-HMAC-SHA256 stale")
            .header("x-amz-date", "19700101T000000Z")
            .body(())
            .unwrap();
        signer().resign(&mut request, b"{}").unwrap();

        let auth = request.headers().get(AUTHORIZATION).unwrap().to_str().unwrap();
        assert!(!auth.contains("stale"));
        assert_ne!(
            request.headers().get("x-amz-date").unwrap(),
            "19700101T000000Z"
        );
    }

    #[test]
    fn mutated_body_changes_signature() {
        let build = || {
            Request::builder()
                .method("POST")
                .uri("/")
                .header(HOST, "kms.us-east-1.amazonaws.com")
                .body(())
                .unwrap()
        };
        let mut a = build();
        let mut b = build();
        signer().resign(&mut a, b"{\"Action\":\"Decrypt\"}").unwrap();
        signer().resign(&mut b, b"{\"Action\":\"Decrypt\",\"Recipient\":{}}").unwrap();
        // Same instant could yield the same date; signatures must differ on
        // the body hash regardless.
        assert_ne!(
            a.headers().get(AUTHORIZATION).unwrap(),
            b.headers().get(AUTHORIZATION).unwrap()
        );
    }
}
