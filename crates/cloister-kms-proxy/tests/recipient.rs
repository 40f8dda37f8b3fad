//! Recipient round-trip against a stubbed KMS upstream.
//!
//! The stub plays the server side of the wire contract: it pulls the
//! enclave's public key out of the injected attestation document, wraps a
//! payload to it as CMS enveloped-data, and returns `CiphertextForRecipient`.
//! The caller must end up with plaintext and no recipient ciphertext.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use cloister_kms_proxy::envelope::testenc::{encode_enveloped_data, Framing};
use cloister_kms_proxy::{KmsEndpoint, KmsProxy};
use cloister_nsm::{AttestationProvider, EphemeralKey};
use cloister_proxy::DirectDialer;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rand::RngCore;
use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const PAYLOAD: &[u8] = &[
    0x3b, 0xe8, 0x11, 0x4e, 0x2c, 0x90, 0x5f, 0x7a, 0x01, 0x22, 0x9d, 0xc4, 0x5e, 0x10, 0x33,
    0x41,
];

/// Recover the recipient public key from the request's attestation document
/// (the dev NSM emits a CBOR map with a `public_key` entry).
fn recipient_key(request_json: &Value) -> RsaPublicKey {
    let document = request_json["Recipient"]["AttestationDocument"]
        .as_str()
        .expect("attestation document");
    let document = B64.decode(document).expect("document base64");
    let value: serde_cbor::Value = serde_cbor::from_slice(&document).expect("document cbor");
    let serde_cbor::Value::Map(map) = value else {
        panic!("document is not a map");
    };
    let key = serde_cbor::Value::Text("public_key".into());
    let serde_cbor::Value::Bytes(spki) = map.get(&key).expect("public_key entry") else {
        panic!("public_key is not bytes");
    };
    RsaPublicKey::from_public_key_der(spki).expect("spki der")
}

async fn start_stub_kms(framing: Framing) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| async move {
                    let auth = req
                        .headers()
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let body = req.into_body().collect().await.unwrap().to_bytes();
                    let json: Value = serde_json::from_slice(&body).unwrap();

                    let response = if json.get("Recipient").is_some() {
                        // The proxy must have re-signed after mutating.
                        assert!(auth.starts_with("AWS4-HMAC-SHA256"), "auth: {auth}");
                        let public = recipient_key(&json);
                        let mut cek = [0u8; 32];
                        let mut iv = [0u8; 16];
                        rand::thread_rng().fill_bytes(&mut cek);
                        rand::thread_rng().fill_bytes(&mut iv);
                        let blob = encode_enveloped_data(&public, &cek, &iv, PAYLOAD, framing);
                        json!({
                            "KeyId": "arn:aws:kms:us-east-1:111122223333:key/test",
                            "CiphertextForRecipient": B64.encode(blob),
                        })
                    } else {
                        json!({ "Keys": [], "Truncated": false })
                    };
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(
                        serde_json::to_vec(&response).unwrap(),
                    ))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    port
}

async fn start_proxy(upstream_port: u16) -> u16 {
    let signer = cloister_kms_proxy::sign::RequestSigner::new(
        "us-east-1",
        aws_credential_types::Credentials::new("AKIDEXAMPLE", "secret", None, None, "test"),
    );
    let proxy = KmsProxy::new(
        AttestationProvider::dev(),
        Arc::new(EphemeralKey::new()),
        Arc::new(DirectDialer),
        KmsEndpoint::plain("127.0.0.1", upstream_port),
        Some(signer),
    )
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(proxy.serve(listener, CancellationToken::new(), Duration::from_secs(5)));
    port
}

#[tokio::test]
async fn decrypt_gets_unwrapped_plaintext() {
    for framing in [Framing::Der, Framing::IndefiniteBer] {
        let upstream = start_stub_kms(framing).await;
        let proxy_port = start_proxy(upstream).await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://127.0.0.1:{proxy_port}/"))
            .header("x-amz-target", "TrentService.Decrypt")
            .json(&json!({
                "Action": "Decrypt",
                "CiphertextBlob": B64.encode(b"opaque"),
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let body: Value = response.json().await.unwrap();
        assert!(body.get("CiphertextForRecipient").is_none());
        let plaintext = B64.decode(body["Plaintext"].as_str().unwrap()).unwrap();
        assert_eq!(plaintext, PAYLOAD, "{framing:?}");
    }
}

#[tokio::test]
async fn unlisted_action_passes_through() {
    let upstream = start_stub_kms(Framing::Der).await;
    let proxy_port = start_proxy(upstream).await;

    let response = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{proxy_port}/"))
        .json(&json!({ "Action": "ListKeys" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["Truncated"], false);
}

#[tokio::test]
async fn existing_recipient_is_rejected() {
    let upstream = start_stub_kms(Framing::Der).await;
    let proxy_port = start_proxy(upstream).await;

    let response = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{proxy_port}/"))
        .json(&json!({
            "Action": "Decrypt",
            "Recipient": { "KeyEncryptionAlgorithm": "RSAES_OAEP_SHA_256" },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}
