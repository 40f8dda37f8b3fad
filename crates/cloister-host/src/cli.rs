//! Wrapper around the vendor enclave CLI.
//!
//! Only four subcommands matter: `run-enclave`, `describe-enclaves`,
//! `terminate-enclave`, and `console`. The binary name is overridable so
//! tests can substitute a stub.

use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

const DEFAULT_PROGRAM: &str = "nitro-cli";

#[derive(Debug, Error)]
pub enum VendorCliError {
    #[error("failed to execute {program} {subcommand}")]
    Spawn {
        program: String,
        subcommand: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{subcommand} failed: {stderr}")]
    CommandFailed {
        subcommand: &'static str,
        stderr: String,
    },
    #[error("unparseable {subcommand} output")]
    BadOutput {
        subcommand: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// One entry of `run-enclave` / `describe-enclaves` output.
#[derive(Debug, Clone, Deserialize)]
pub struct EnclaveDescription {
    #[serde(rename = "EnclaveName")]
    pub enclave_name: String,
    #[serde(rename = "EnclaveID")]
    pub enclave_id: String,
    #[serde(rename = "ProcessID")]
    pub process_id: u32,
}

/// Validated launch parameters.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub eif_path: PathBuf,
    pub cpu_count: u32,
    pub memory_mb: u64,
    pub cid: Option<u32>,
    pub debug_mode: bool,
}

#[derive(Debug, Error)]
pub enum LaunchSpecError {
    #[error("cpu_count must be at least 1")]
    CpuCount,
    #[error("memory must be at least 64 MiB")]
    Memory,
    #[error("EIF path must not be empty")]
    EifPath,
    #[error("enclave CID must be non-zero")]
    Cid,
}

impl LaunchSpec {
    pub fn validate(&self) -> Result<(), LaunchSpecError> {
        if self.cpu_count < 1 {
            return Err(LaunchSpecError::CpuCount);
        }
        if self.memory_mb < 64 {
            return Err(LaunchSpecError::Memory);
        }
        if self.eif_path.as_os_str().is_empty() {
            return Err(LaunchSpecError::EifPath);
        }
        if self.cid == Some(0) {
            return Err(LaunchSpecError::Cid);
        }
        Ok(())
    }
}

pub struct VendorCli {
    program: PathBuf,
}

impl VendorCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// `CLOISTER_NITRO_CLI` overrides the binary, which is how the tests
    /// substitute a stub.
    pub fn from_env() -> Self {
        Self::new(std::env::var("CLOISTER_NITRO_CLI").unwrap_or_else(|_| DEFAULT_PROGRAM.into()))
    }

    async fn output(
        &self,
        subcommand: &'static str,
        args: &[String],
    ) -> Result<Vec<u8>, VendorCliError> {
        debug!(program = %self.program.display(), subcommand, ?args, "invoking vendor cli");
        let output = tokio::process::Command::new(&self.program)
            .arg(subcommand)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| VendorCliError::Spawn {
                program: self.program.display().to_string(),
                subcommand,
                source,
            })?;
        if !output.status.success() {
            return Err(VendorCliError::CommandFailed {
                subcommand,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    pub async fn run_enclave(&self, spec: &LaunchSpec) -> Result<EnclaveDescription, VendorCliError> {
        let mut args = vec![
            "--cpu-count".to_string(),
            spec.cpu_count.to_string(),
            "--memory".to_string(),
            spec.memory_mb.to_string(),
            "--eif-path".to_string(),
            spec.eif_path.display().to_string(),
        ];
        if let Some(cid) = spec.cid {
            args.push("--enclave-cid".to_string());
            args.push(cid.to_string());
        }
        if spec.debug_mode {
            args.push("--debug-mode".to_string());
        }
        let stdout = self.output("run-enclave", &args).await?;
        serde_json::from_slice(&stdout).map_err(|source| VendorCliError::BadOutput {
            subcommand: "run-enclave",
            source,
        })
    }

    pub async fn describe_enclaves(&self) -> Result<Vec<EnclaveDescription>, VendorCliError> {
        let stdout = self.output("describe-enclaves", &[]).await?;
        serde_json::from_slice(&stdout).map_err(|source| VendorCliError::BadOutput {
            subcommand: "describe-enclaves",
            source,
        })
    }

    pub async fn terminate_enclave(&self, enclave_id: &str) -> Result<(), VendorCliError> {
        self.output(
            "terminate-enclave",
            &["--enclave-id".to_string(), enclave_id.to_string()],
        )
        .await?;
        info!(enclave_id, "terminate-enclave issued");
        Ok(())
    }

    /// Attach the debug console and stream it into `sink` until the console
    /// process exits.
    pub async fn console<W>(&self, enclave_id: &str, mut sink: W) -> Result<(), VendorCliError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut child = tokio::process::Command::new(&self.program)
            .arg("console")
            .arg("--enclave-id")
            .arg(enclave_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| VendorCliError::Spawn {
                program: self.program.display().to_string(),
                subcommand: "console",
                source,
            })?;

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if sink.write_all(line.as_bytes()).await.is_err()
                    || sink.write_all(b"\n").await.is_err()
                {
                    break;
                }
            }
        }
        match child.wait().await {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => {
                warn!(enclave_id, %status, "console exited");
                Ok(())
            }
            Err(source) => Err(VendorCliError::Spawn {
                program: self.program.display().to_string(),
                subcommand: "console",
                source,
            }),
        }
    }
}
