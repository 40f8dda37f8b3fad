//! NSM driver backends.

use crate::NsmError;
use aws_nitro_enclaves_nsm_api::api::{ErrorCode, Request, Response};
use aws_nitro_enclaves_nsm_api::driver as nsm;
use rand::RngCore;
use serde_cbor::Value;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// A processor of NSM requests. Implementations must be cheap to call; the
/// provider handles locking and blocking-tier scheduling.
pub trait NsmDriver: Send + Sync {
    fn process(&self, request: Request) -> Response;
}

/// The real `/dev/nsm` session, opened once and closed on drop.
pub struct NsmDevice {
    fd: i32,
}

impl NsmDevice {
    pub fn open() -> Result<Self, NsmError> {
        let fd = nsm::nsm_init();
        if fd < 0 {
            return Err(NsmError::DeviceUnavailable);
        }
        info!(fd, "nsm device opened");
        Ok(Self { fd })
    }
}

impl NsmDriver for NsmDevice {
    fn process(&self, request: Request) -> Response {
        nsm::nsm_process_request(self.fd, request)
    }
}

impl Drop for NsmDevice {
    fn drop(&mut self) {
        nsm::nsm_exit(self.fd);
    }
}

/// Development stand-in for hosts without the NSM: OS randomness for
/// `GetRandom` and an unsigned CBOR document shaped like the device's output
/// for `Attestation`.
pub struct DevNsm;

const DEV_PCR_COUNT: u64 = 3;

impl NsmDriver for DevNsm {
    fn process(&self, request: Request) -> Response {
        match request {
            Request::GetRandom => {
                let mut random = vec![0u8; 256];
                rand::thread_rng().fill_bytes(&mut random);
                Response::GetRandom { random }
            }
            Request::Attestation {
                user_data,
                nonce,
                public_key,
            } => {
                let timestamp = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);

                let mut pcrs = BTreeMap::new();
                for index in 0..DEV_PCR_COUNT {
                    pcrs.insert(
                        Value::Integer(index as i128),
                        Value::Bytes(vec![0u8; 48]),
                    );
                }

                let mut doc = BTreeMap::new();
                doc.insert(
                    Value::Text("module_id".into()),
                    Value::Text("dev-attestation".into()),
                );
                doc.insert(Value::Text("digest".into()), Value::Text("SHA384".into()));
                doc.insert(Value::Text("timestamp".into()), Value::Integer(timestamp as i128));
                doc.insert(Value::Text("pcrs".into()), Value::Map(pcrs));
                doc.insert(
                    Value::Text("user_data".into()),
                    opt_bytes(user_data.map(|b| b.into_vec())),
                );
                doc.insert(
                    Value::Text("nonce".into()),
                    opt_bytes(nonce.map(|b| b.into_vec())),
                );
                doc.insert(
                    Value::Text("public_key".into()),
                    opt_bytes(public_key.map(|b| b.into_vec())),
                );

                match serde_cbor::to_vec(&Value::Map(doc)) {
                    Ok(document) => Response::Attestation { document },
                    Err(_) => Response::Error(ErrorCode::InternalError),
                }
            }
            _ => Response::Error(ErrorCode::InvalidOperation),
        }
    }
}

fn opt_bytes(bytes: Option<Vec<u8>>) -> Value {
    match bytes {
        Some(b) => Value::Bytes(b),
        None => Value::Null,
    }
}
