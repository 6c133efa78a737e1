//! Full coordinator integration tests: startup sequencing, idempotent
//! connect/disconnect, status reporting, and unbound-command error paths —
//! everything that does not require a real serial device attached.

use smd_channel::Command;
use smd_core::config::Config;
use smd_daemon::Daemon;

async fn start_test_daemon() -> (std::sync::Arc<Daemon>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        no_autoconnect: true,
        ..Config::default()
    };
    let daemon = Daemon::start(config, dir.path().to_path_buf())
        .await
        .expect("daemon starts in a fresh, empty base_dir");
    (daemon, dir)
}

#[tokio::test]
async fn startup_writes_pid_record_and_started_marker() {
    let (daemon, dir) = start_test_daemon().await;

    assert!(dir.path().join("daemon.pid").exists());
    assert!(dir.path().join("daemon.lock").exists());

    let status = daemon.dispatch(Command::Status).await;
    assert!(status.success);
    let payload = status.status.expect("status command returns a payload");
    assert!(payload.running);
    assert!(!payload.monitoring);
    assert_eq!(payload.session_id, daemon.session_id());
    assert_eq!(payload.pid, std::process::id());
}

#[tokio::test]
async fn second_start_against_the_same_base_dir_fails() {
    let (daemon, dir) = start_test_daemon().await;

    let config = Config::default();
    let second = Daemon::start(config, dir.path().to_path_buf()).await;
    assert!(second.is_err(), "a live daemon must refuse a second acquire");

    daemon.stop();
}

#[tokio::test]
async fn connect_to_a_nonexistent_port_fails_and_leaves_coordinator_unbound() {
    let (daemon, _dir) = start_test_daemon().await;

    let resp = daemon
        .connect(Some("/dev/does-not-exist-12345".to_string()), 115_200)
        .await;
    assert!(!resp.success);

    let status = daemon.dispatch(Command::Status).await;
    assert!(!status.status.unwrap().monitoring);
}

#[tokio::test]
async fn disconnect_without_a_binding_is_idempotent() {
    let (daemon, _dir) = start_test_daemon().await;

    let first = daemon.disconnect().await;
    assert!(first.success);
    let second = daemon.disconnect().await;
    assert!(second.success);
}

#[tokio::test]
async fn write_without_a_connected_port_is_rejected() {
    let (daemon, _dir) = start_test_daemon().await;

    let resp = daemon
        .dispatch(Command::Write { data: "hello".to_string() })
        .await;
    assert!(!resp.success);
}

#[tokio::test]
async fn write_with_empty_data_is_rejected() {
    let (daemon, _dir) = start_test_daemon().await;

    let resp = daemon
        .dispatch(Command::Write { data: String::new() })
        .await;
    assert!(!resp.success);
}

#[tokio::test]
async fn set_echo_round_trips_through_status_response() {
    let (daemon, _dir) = start_test_daemon().await;

    let resp = daemon
        .dispatch(Command::SetEcho { enabled: true })
        .await;
    assert!(resp.success);
    assert_eq!(resp.echo_enabled, Some(true));
}
