//! The user entrypoint: spawn, output capture, exit collection, reaping.
//!
//! The entrypoint is preserved by the image build pipeline as a small JSON
//! file next to the manifest. The child's stdout and stderr are merged into
//! one line stream that the supervisor ships to the host log channel; its
//! exit status travels over the status channel.

use crate::system::is_pid1;
use crate::SupervisorError;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;
use std::process::Stdio;
use tracing::{debug, warn};

/// The original container entrypoint, captured at image build time.
#[derive(Debug, Clone, Deserialize)]
pub struct Entrypoint {
    pub argv: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub workdir: Option<String>,
}

impl Entrypoint {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SupervisorError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|source| SupervisorError::EntrypointRead {
            path: path.display().to_string(),
            source,
        })?;
        let entry: Entrypoint =
            serde_json::from_slice(&raw).map_err(|source| SupervisorError::EntrypointParse {
                path: path.display().to_string(),
                source,
            })?;
        if entry.argv.is_empty() {
            return Err(SupervisorError::EmptyEntrypoint);
        }
        Ok(entry)
    }
}

/// A running entrypoint. `output` yields merged stdout/stderr lines; `exit`
/// resolves once with the child's exit code.
pub struct SpawnedChild {
    pub pid: u32,
    pub output: tokio::sync::mpsc::Receiver<String>,
    pub exit: tokio::sync::oneshot::Receiver<i32>,
}

/// Spawn the entrypoint with `extra_env` layered over its recorded
/// environment. Output pumping and exit collection run on plain threads; the
/// child's pipes and `waitpid` are blocking interfaces.
pub fn spawn_entrypoint(
    entry: &Entrypoint,
    extra_env: &[(String, String)],
) -> Result<SpawnedChild, SupervisorError> {
    let mut command = std::process::Command::new(&entry.argv[0]);
    command
        .args(&entry.argv[1..])
        .envs(&entry.env)
        .envs(extra_env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(workdir) = &entry.workdir {
        command.current_dir(workdir);
    }

    let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
        command: entry.argv[0].clone(),
        source,
    })?;
    let pid = child.id();
    debug!(pid, command = %entry.argv[0], "entrypoint spawned");

    let (line_tx, line_rx) = tokio::sync::mpsc::channel::<String>(256);
    if let Some(stdout) = child.stdout.take() {
        pump_lines(stdout, line_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        pump_lines(stderr, line_tx);
    }

    let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();
    std::thread::spawn(move || {
        let code = if is_pid1() {
            wait_reaping(pid as i32)
        } else {
            wait_plain(child)
        };
        let _ = exit_tx.send(code);
    });

    Ok(SpawnedChild {
        pid,
        output: line_rx,
        exit: exit_rx,
    })
}

fn pump_lines<R: std::io::Read + Send + 'static>(
    pipe: R,
    tx: tokio::sync::mpsc::Sender<String>,
) {
    std::thread::spawn(move || {
        let reader = std::io::BufReader::new(pipe);
        for line in reader.lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    });
}

fn wait_plain(mut child: std::process::Child) -> i32 {
    match child.wait() {
        Ok(status) => exit_code_of(status),
        Err(e) => {
            warn!(error = %e, "wait on entrypoint failed");
            1
        }
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

/// The classic init wait loop: `waitpid(-1)` reaps every descendant; the
/// loop ends when the direct child is the one collected. Remaining zombies
/// are swept non-blockingly before returning.
fn wait_reaping(child_pid: i32) -> i32 {
    loop {
        let mut status: libc::c_int = 0;
        let reaped = unsafe { libc::waitpid(-1, &mut status, 0) };
        if reaped < 0 {
            warn!("waitpid failed before the entrypoint was collected");
            return 1;
        }
        if reaped == child_pid {
            let code = if libc::WIFEXITED(status) {
                libc::WEXITSTATUS(status)
            } else if libc::WIFSIGNALED(status) {
                128 + libc::WTERMSIG(status)
            } else {
                1
            };
            let mut more: libc::c_int = 0;
            while unsafe { libc::waitpid(-1, &mut more, libc::WNOHANG) } > 0 {}
            return code;
        }
        debug!(pid = reaped, "reaped orphan");
    }
}
