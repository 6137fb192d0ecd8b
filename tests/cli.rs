//! Binary-level CLI checks

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_help_lists_commands() {
    Command::cargo_bin("procsi")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("stop"));
}

#[test]
fn test_version_flag() {
    Command::cargo_bin("procsi")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_status_without_daemon_fails() {
    let tmp = tempfile::tempdir().unwrap();
    Command::cargo_bin("procsi")
        .unwrap()
        .args(["--project-root"])
        .arg(tmp.path())
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("connect"));
}

#[test]
fn test_stop_without_daemon_fails() {
    let tmp = tempfile::tempdir().unwrap();
    Command::cargo_bin("procsi")
        .unwrap()
        .args(["--project-root"])
        .arg(tmp.path())
        .arg("stop")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not running"));
}
