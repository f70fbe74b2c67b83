//! End-to-end tests for the `pk` binary

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// `pk` isolated from the user's config and log directories
fn pk(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("pk").expect("pk binary is built");
    cmd.current_dir(home.path())
        .env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path().join("config"))
        .env("XDG_DATA_HOME", home.path().join("data"));
    cmd
}

// =============================================================================
// Running commands
// =============================================================================

#[test]
fn test_pool_prints_in_input_order() {
    let home = TempDir::new().unwrap();
    // Each item is its own sleep in tenths of a second, so completion order differs
    pk(&home)
        .args(["pool", "-n", "3", "--", "sleep 0.{}; echo item-{}"])
        .write_stdin("3\n1\n2\n")
        .assert()
        .success()
        .stdout("item-3\nitem-1\nitem-2\n");
}

#[test]
fn test_batch_reads_input_file() {
    let home = TempDir::new().unwrap();
    let input = home.path().join("items.txt");
    std::fs::write(&input, "alpha\n\nbeta\n").unwrap();

    pk(&home)
        .args(["batch", "-s", "2", "--input"])
        .arg(&input)
        .args(["--", "echo"])
        .assert()
        .success()
        .stdout("alpha\nbeta\n");
}

#[test]
fn test_throttle_runs_every_item() {
    let home = TempDir::new().unwrap();
    pk(&home)
        .args(["throttle", "-n", "2", "--interval-ms", "10", "--", "printf '%s,'"])
        .write_stdin("a\nb\nc\n")
        .assert()
        .success()
        .stdout("a,b,c,");
}

#[test]
fn test_failure_aborts_by_default() {
    let home = TempDir::new().unwrap();
    pk(&home)
        .args(["pool", "-n", "1", "--", "test {} != bad"])
        .write_stdin("ok\nbad\nlater\n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Command for item 'bad' exited with exit code 1"));
}

#[test]
fn test_keep_going_reports_every_failure() {
    let home = TempDir::new().unwrap();
    pk(&home)
        .args(["pool", "--keep-going", "--", "test {} != bad && echo {}"])
        .write_stdin("one\nbad\ntwo\n")
        .assert()
        .failure()
        .stdout("one\ntwo\n")
        .stderr(predicate::str::contains("2 succeeded, 1 failed"))
        .stderr(predicate::str::contains("1 item(s) failed"));
}

#[test]
fn test_json_output() {
    let home = TempDir::new().unwrap();
    let output = pk(&home)
        .args(["pool", "--keep-going", "--format", "json", "--", "test {} = 1 && echo yes"])
        .write_stdin("1\n2\n")
        .output()
        .unwrap();

    assert!(!output.status.success());
    let results: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(results[0]["status"], "fulfilled");
    assert_eq!(results[0]["value"]["item"], "1");
    assert_eq!(results[0]["value"]["stdout"], "yes\n");
    assert_eq!(results[1]["status"], "rejected");
    assert!(results[1]["reason"].as_str().unwrap().contains("'2'"));
}

#[test]
fn test_run_uses_configured_policy() {
    let home = TempDir::new().unwrap();
    let config = home.path().join("pk.yml");
    std::fs::write(&config, "policy: batch\nbatch:\n  batch-size: 2\n").unwrap();

    pk(&home)
        .arg("--config")
        .arg(&config)
        .args(["run", "--", "echo"])
        .write_stdin("x\ny\nz\n")
        .assert()
        .success()
        .stdout("x\ny\nz\n");
}

// =============================================================================
// Configuration
// =============================================================================

#[test]
fn test_config_prints_effective_yaml() {
    let home = TempDir::new().unwrap();
    std::fs::write(home.path().join(".pacekeeper.yml"), "throttle:\n  interval-ms: 250\n").unwrap();

    pk(&home)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("interval-ms: 250"))
        .stdout(predicate::str::contains("policy: concurrency"));
}

#[test]
fn test_zero_concurrency_rejected() {
    let home = TempDir::new().unwrap();
    pk(&home)
        .args(["pool", "-n", "0", "--", "echo"])
        .write_stdin("a\n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_concurrency must be a positive integer"));
}

#[test]
fn test_missing_config_file_is_fatal() {
    let home = TempDir::new().unwrap();
    pk(&home)
        .args(["--config", "does-not-exist.yml", "config"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
}

#[test]
fn test_command_required() {
    let home = TempDir::new().unwrap();
    pk(&home).arg("pool").assert().failure();
}
