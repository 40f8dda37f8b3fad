//! Controller lifecycle against a stubbed vendor CLI.

use cloister_host::{Controller, ControllerState, ExitReason, LaunchSpec, VendorCli};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn spec() -> LaunchSpec {
    LaunchSpec {
        eif_path: "demo.eif".into(),
        cpu_count: 2,
        memory_mb: 512,
        cid: Some(17),
        debug_mode: false,
    }
}

/// Write an executable stub that answers `run-enclave` and plays
/// `describe-enclaves` as present for `alive_polls` invocations, then gone.
fn write_stub(dir: &PathBuf, alive_polls: u32) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let state = dir.join("count");
    let marker = dir.join("terminated");
    let script = format!(
        r#"#!/bin/sh
case "$1" in
  run-enclave)
    echo '{{"EnclaveName":"demo","EnclaveID":"enc-test-1","ProcessID":101}}'
    ;;
  describe-enclaves)
    count=$(cat "{state}" 2>/dev/null || echo 0)
    count=$((count + 1))
    echo "$count" > "{state}"
    if [ "$count" -le {alive_polls} ]; then
      echo '[{{"EnclaveName":"demo","EnclaveID":"enc-test-1","ProcessID":101}}]'
    else
      echo '[]'
    fi
    ;;
  terminate-enclave)
    touch "{marker}"
    echo '{{}}'
    ;;
  *)
    exit 1
    ;;
esac
"#,
        state = state.display(),
        marker = marker.display(),
        alive_polls = alive_polls,
    );

    let path = dir.join("nitro-cli-stub");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("cloister-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[tokio::test]
async fn detects_disappearance_within_one_poll() {
    let dir = temp_dir("disappear");
    let stub = write_stub(&dir, 3);
    let poll = Duration::from_millis(100);

    let mut controller = Controller::new(VendorCli::new(&stub)).with_poll_interval(poll);
    controller.launch(&spec(), 17, vec![8000]).await.unwrap();
    assert_eq!(controller.state(), ControllerState::Running);
    assert_eq!(controller.instance().unwrap().enclave_id, "enc-test-1");

    let started = Instant::now();
    let reason = controller
        .supervise(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(reason, ExitReason::Disappeared);
    assert_eq!(controller.state(), ControllerState::Exited);
    // Three present polls plus the empty one, with a second of slack.
    assert!(started.elapsed() < poll * 4 + Duration::from_secs(1));

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn cancellation_drains_and_terminates() {
    let dir = temp_dir("drain");
    let stub = write_stub(&dir, u32::MAX);

    let mut controller = Controller::new(VendorCli::new(&stub))
        .with_poll_interval(Duration::from_millis(50));
    controller.launch(&spec(), 17, vec![]).await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        trigger.cancel();
    });

    let reason = controller.supervise(&cancel).await.unwrap();
    assert_eq!(reason, ExitReason::Cancelled);
    assert_eq!(controller.state(), ControllerState::Exited);
    assert!(dir.join("terminated").exists());

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn launch_failure_is_terminal() {
    let dir = temp_dir("fail");
    let path = dir.join("nitro-cli-stub");
    std::fs::write(&path, "#!/bin/sh\necho 'allocator: not enough memory' >&2\nexit 1\n").unwrap();
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let mut controller = Controller::new(VendorCli::new(&path));
    let err = controller.launch(&spec(), 17, vec![]).await.unwrap_err();
    assert!(err.to_string().contains("launch failed"));
    assert_eq!(controller.state(), ControllerState::Failed);

    std::fs::remove_dir_all(&dir).unwrap();
}
