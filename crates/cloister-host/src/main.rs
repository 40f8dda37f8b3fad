use anyhow::{Context, Result};
use cloister_host::{
    random_cid, spawn_egress, spawn_ingress, spawn_log_drain, spawn_status_listener, Controller,
    ExitReason, LaunchSpec, VendorCli,
};
use cloister_manifest::Manifest;
use cloister_transport::Transport;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const EXIT_LAUNCH_FAILURE: i32 = 2;
const EXIT_DISAPPEARED: i32 = 3;
const EXIT_INTERRUPTED: i32 = 130;

struct Args {
    manifest: PathBuf,
    eif: PathBuf,
    cpu_count: Option<u32>,
    memory_mb: Option<u64>,
    bind_host: IpAddr,
    debug: bool,
}

fn usage() -> ! {
    eprintln!(
        "Usage: cloister-host --manifest <manifest.yaml> --eif <image.eif> \
         [--cpu-count N] [--memory MB] [--bind-host IP] [--debug]"
    );
    std::process::exit(1);
}

fn parse_args() -> Args {
    let mut manifest = None;
    let mut eif = None;
    let mut cpu_count = None;
    let mut memory_mb = None;
    let mut bind_host: IpAddr = IpAddr::from([0, 0, 0, 0]);
    let mut debug = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--manifest" => manifest = args.next().map(PathBuf::from),
            "--eif" => eif = args.next().map(PathBuf::from),
            "--cpu-count" => cpu_count = args.next().and_then(|v| v.parse().ok()),
            "--memory" => memory_mb = args.next().and_then(|v| v.parse().ok()),
            "--bind-host" => match args.next().and_then(|v| v.parse().ok()) {
                Some(host) => bind_host = host,
                None => usage(),
            },
            "--debug" => debug = true,
            _ => usage(),
        }
    }
    let (Some(manifest), Some(eif)) = (manifest, eif) else {
        usage();
    };
    Args {
        manifest,
        eif,
        cpu_count,
        memory_mb,
        bind_host,
        debug,
    }
}

#[tokio::main]
async fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,hyper=warn,h2=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let code = match run(parse_args()).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = ?e, "host supervisor failed");
            1
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> Result<i32> {
    let manifest = Manifest::load(&args.manifest).context("loading manifest")?;
    let transport = Transport::from_env();
    let cid = random_cid();

    let spec = LaunchSpec {
        eif_path: args.eif,
        cpu_count: args.cpu_count.unwrap_or(manifest.defaults.cpu_count),
        memory_mb: args.memory_mb.unwrap_or(manifest.defaults.memory_mb),
        cid: Some(cid),
        debug_mode: args.debug,
    };
    spec.validate().context("validating launch parameters")?;

    let cancel = CancellationToken::new();
    let interrupted = Arc::new(AtomicBool::new(false));
    spawn_signal_handler(cancel.clone(), interrupted.clone());

    // All host plumbing comes up before the enclave so the first ingress
    // connection after launch has somewhere to land.
    spawn_ingress(&manifest, transport, cid, args.bind_host, &cancel)
        .await
        .context("starting ingress forwarders")?;
    spawn_egress(transport, &cancel)
        .await
        .context("starting egress proxy")?;
    spawn_log_drain(transport, &cancel)
        .await
        .context("starting log drain")?;
    spawn_status_listener(transport, &cancel)
        .await
        .context("starting status listener")?;

    let ingress_ports = manifest.ingress.iter().map(|i| i.listen_port).collect();
    let mut controller = Controller::new(VendorCli::from_env());
    if let Err(e) = controller.launch(&spec, cid, ingress_ports).await {
        error!(error = %e, "enclave launch failed");
        return Ok(EXIT_LAUNCH_FAILURE);
    }

    if args.debug {
        // Debug mode streams the console instead of polling liveness.
        let console = async {
            if let Err(e) = controller.attach_console(tokio::io::stdout()).await {
                error!(error = %e, "console attach failed");
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = console => {}
        }
        controller.drain().await;
        cancel.cancel();
        return Ok(exit_code_for_cancel(&interrupted));
    }

    match controller.supervise(&cancel).await? {
        ExitReason::Disappeared => {
            cancel.cancel();
            Ok(EXIT_DISAPPEARED)
        }
        ExitReason::Cancelled => {
            info!("shutdown complete");
            Ok(exit_code_for_cancel(&interrupted))
        }
    }
}

fn exit_code_for_cancel(interrupted: &AtomicBool) -> i32 {
    if interrupted.load(Ordering::Relaxed) {
        EXIT_INTERRUPTED
    } else {
        0
    }
}

fn spawn_signal_handler(cancel: CancellationToken, interrupted: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut terminate =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        error!(error = %e, "failed to install SIGTERM handler");
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => interrupted.store(true, Ordering::Relaxed),
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            interrupted.store(true, Ordering::Relaxed);
        }
        info!("shutdown signal received");
        cancel.cancel();
    });
}
