use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("nightshift").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("overnight"))
        .stdout(predicate::str::contains("init"))
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("once"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("queue"));
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("nightshift").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("nightshift"));
}

#[test]
fn test_missing_config_exits_with_config_error_code() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = Command::cargo_bin("nightshift").unwrap();
    cmd.current_dir(dir.path())
        .args(["status"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("cannot read"));
}

#[test]
fn test_init_writes_default_config_once() {
    let dir = tempfile::tempdir().unwrap();

    Command::cargo_bin("nightshift")
        .unwrap()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("nightshift.toml"));
    assert!(dir.path().join("nightshift.toml").exists());

    // Refuses to clobber an existing config.
    Command::cargo_bin("nightshift")
        .unwrap()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_queue_list_on_fresh_state_is_empty() {
    let dir = tempfile::tempdir().unwrap();

    Command::cargo_bin("nightshift")
        .unwrap()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success();

    // Point the workspace at the temp dir so state lands there too.
    let config_path = dir.path().join("nightshift.toml");
    let config = std::fs::read_to_string(&config_path)
        .unwrap()
        .replace("~/work/project", &dir.path().display().to_string());
    std::fs::write(&config_path, config).unwrap();

    Command::cargo_bin("nightshift")
        .unwrap()
        .current_dir(dir.path())
        .args(["queue", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no matching tasks"));
}
