use anyhow::{Context, Result};
use cloister_init::child::{spawn_entrypoint, Entrypoint};
use cloister_init::forwarder::{spawn_egress_proxy, spawn_ingress, spawn_kms_proxy};
use cloister_init::system::bring_loopback_up;
use cloister_manifest::Manifest;
use cloister_nsm::{seed_system_entropy, AttestationProvider, EphemeralKey};
use cloister_transport::{Transport, APP_LOG_PORT, EGRESS_PORT, EXIT_STATUS_PORT};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_MANIFEST_PATH: &str = "/etc/cloister/manifest.yaml";
const DEFAULT_ENTRYPOINT_PATH: &str = "/etc/cloister/entrypoint.json";
const DEFAULT_ENTROPY_PATH: &str = "/dev/random";

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,hyper=warn,h2=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            error!(error = ?e, "supervisor failed");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let transport = Transport::from_env();
    let manifest = Manifest::load(env_or("CLOISTER_MANIFEST_PATH", DEFAULT_MANIFEST_PATH))
        .context("loading manifest")?;
    info!(name = %manifest.name, "supervisor starting");

    // Startup is strictly sequential: loopback, entropy, KMS proxy, egress,
    // ingress, then the user entrypoint. Nothing may serve before the
    // entropy pool is seeded; the entrypoint may make RNG-dependent calls
    // immediately.
    bring_loopback_up(transport).context("bringing loopback up")?;

    let provider = AttestationProvider::from_env().context("opening attestation device")?;
    seed_system_entropy(&provider, env_or("CLOISTER_ENTROPY_PATH", DEFAULT_ENTROPY_PATH))
        .await
        .context("seeding entropy")?;

    let keys = Arc::new(EphemeralKey::new());
    let cancel = CancellationToken::new();

    let kms_port = spawn_kms_proxy(&manifest, transport, provider, keys, &cancel)
        .await
        .context("starting kms proxy")?;
    spawn_egress_proxy(&manifest, transport, EGRESS_PORT as u16, &cancel)
        .await
        .context("starting egress proxy")?;
    spawn_ingress(&manifest, transport, &cancel)
        .await
        .context("starting ingress forwarders")?;

    let proxy_url = format!("http://127.0.0.1:{EGRESS_PORT}");
    let mut extra_env = vec![
        ("HTTP_PROXY".to_string(), proxy_url.clone()),
        ("HTTPS_PROXY".to_string(), proxy_url),
    ];
    if let Some(port) = kms_port {
        extra_env.push((
            "AWS_KMS_ENDPOINT".to_string(),
            format!("http://127.0.0.1:{port}"),
        ));
    }

    let entrypoint = Entrypoint::load(env_or("CLOISTER_ENTRYPOINT_PATH", DEFAULT_ENTRYPOINT_PATH))
        .context("loading entrypoint")?;
    let child = spawn_entrypoint(&entrypoint, &extra_env).context("spawning entrypoint")?;
    info!(pid = child.pid, "entrypoint running");

    let log_task = tokio::spawn(forward_logs(transport, child.output));
    let code = child.exit.await.unwrap_or(1);
    info!(code, "entrypoint exited");

    report_exit(transport, code).await;
    cancel.cancel();
    let _ = log_task.await;
    Ok(code)
}

/// Ship entrypoint output to the host log channel; fall back to local
/// logging when the channel cannot be reached.
async fn forward_logs(transport: Transport, mut output: tokio::sync::mpsc::Receiver<String>) {
    let mut channel = match transport.dial_parent(APP_LOG_PORT).await {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(error = %e, "log channel unavailable, logging locally");
            None
        }
    };
    while let Some(line) = output.recv().await {
        match channel.as_mut() {
            Some(stream) => {
                if stream.write_all(line.as_bytes()).await.is_err()
                    || stream.write_all(b"\n").await.is_err()
                {
                    warn!("log channel broke, logging locally");
                    info!(target: "app", "{line}");
                    channel = None;
                }
            }
            None => info!(target: "app", "{line}"),
        }
    }
    if let Some(mut stream) = channel {
        let _ = stream.shutdown().await;
    }
}

/// One-line JSON exit report on the status channel; best effort.
async fn report_exit(transport: Transport, code: i32) {
    match transport.dial_parent(EXIT_STATUS_PORT).await {
        Ok(mut stream) => {
            let report = serde_json::json!({ "code": code }).to_string();
            let _ = stream.write_all(report.as_bytes()).await;
            let _ = stream.write_all(b"\n").await;
            let _ = stream.shutdown().await;
        }
        Err(e) => warn!(error = %e, "status channel unavailable"),
    }
}
