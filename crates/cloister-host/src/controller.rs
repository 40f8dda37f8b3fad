//! Enclave lifecycle controller.
//!
//! Owns the instance descriptor for one enclave run. Launches through the
//! vendor CLI, polls `describe-enclaves` for liveness while running, and
//! performs a bounded drain on cancellation. The controller never restarts
//! an enclave; its only recovery action is controlled shutdown.

use crate::cli::{EnclaveDescription, LaunchSpec, VendorCli, VendorCliError};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Launching,
    Running,
    Draining,
    Exited,
    Failed,
}

/// Why a supervised enclave stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Cancellation was requested and the enclave was drained.
    Cancelled,
    /// Liveness polling no longer found the enclave.
    Disappeared,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("enclave launch failed")]
    Launch(#[source] VendorCliError),
    #[error("controller is in state {0:?}, expected {1:?}")]
    BadState(ControllerState, ControllerState),
}

/// Descriptor of the one running enclave.
#[derive(Debug, Clone)]
pub struct EnclaveInstance {
    pub enclave_id: String,
    pub name: String,
    pub process_id: u32,
    pub cid: u32,
    /// Ingress ports; host listen port and host-socket port are the same
    /// number by contract.
    pub ingress_ports: Vec<u16>,
}

pub struct Controller {
    cli: VendorCli,
    poll_interval: Duration,
    state: ControllerState,
    instance: Option<EnclaveInstance>,
}

impl Controller {
    pub fn new(cli: VendorCli) -> Self {
        Self {
            cli,
            poll_interval: POLL_INTERVAL,
            state: ControllerState::Idle,
            instance: None,
        }
    }

    /// Shorten the liveness poll; used by tests.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn instance(&self) -> Option<&EnclaveInstance> {
        self.instance.as_ref()
    }

    /// `Idle → Launching → Running`, or `Failed` when the vendor CLI refuses.
    pub async fn launch(
        &mut self,
        spec: &LaunchSpec,
        cid: u32,
        ingress_ports: Vec<u16>,
    ) -> Result<(), ControllerError> {
        if self.state != ControllerState::Idle {
            return Err(ControllerError::BadState(self.state, ControllerState::Idle));
        }
        self.state = ControllerState::Launching;
        info!(eif = %spec.eif_path.display(), cid, "launching enclave");

        let described: EnclaveDescription = match self.cli.run_enclave(spec).await {
            Ok(described) => described,
            Err(e) => {
                self.state = ControllerState::Failed;
                return Err(ControllerError::Launch(e));
            }
        };

        info!(
            enclave_id = %described.enclave_id,
            process_id = described.process_id,
            "enclave running"
        );
        self.state = ControllerState::Running;
        self.instance = Some(EnclaveInstance {
            enclave_id: described.enclave_id,
            name: described.enclave_name,
            process_id: described.process_id,
            cid,
            ingress_ports,
        });
        Ok(())
    }

    /// Poll for liveness until the enclave disappears or `cancel` fires.
    /// Transient `describe-enclaves` failures are logged and retried on the
    /// next tick.
    pub async fn supervise(&mut self, cancel: &CancellationToken) -> Result<ExitReason, ControllerError> {
        if self.state != ControllerState::Running {
            return Err(ControllerError::BadState(
                self.state,
                ControllerState::Running,
            ));
        }
        let enclave_id = self
            .instance
            .as_ref()
            .map(|i| i.enclave_id.clone())
            .unwrap_or_default();

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.drain().await;
                    return Ok(ExitReason::Cancelled);
                }
                _ = ticker.tick() => {
                    match self.cli.describe_enclaves().await {
                        Ok(list) => {
                            if !list.iter().any(|d| d.enclave_id == enclave_id) {
                                warn!(enclave_id, "enclave disappeared");
                                self.state = ControllerState::Exited;
                                return Ok(ExitReason::Disappeared);
                            }
                        }
                        Err(e) => warn!(error = %e, "describe-enclaves failed, will retry"),
                    }
                }
            }
        }
    }

    /// Best-effort terminate, then `Exited`. The caller is responsible for
    /// draining its proxies alongside.
    pub async fn drain(&mut self) {
        self.state = ControllerState::Draining;
        if let Some(instance) = &self.instance {
            info!(enclave_id = %instance.enclave_id, "draining enclave");
            if let Err(e) = self.cli.terminate_enclave(&instance.enclave_id).await {
                warn!(error = %e, "terminate-enclave failed");
            }
        }
        self.state = ControllerState::Exited;
    }

    /// Debug mode: attach the enclave console and stream it into `sink`.
    /// Liveness polling is not performed while attached.
    pub async fn attach_console<W>(&self, sink: W) -> Result<(), VendorCliError>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let enclave_id = self
            .instance
            .as_ref()
            .map(|i| i.enclave_id.clone())
            .unwrap_or_default();
        self.cli.console(&enclave_id, sink).await
    }
}
