// End-to-end tests for the recovery-engine binary

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn cli() -> Command {
    let mut cmd = Command::cargo_bin("recovery-engine").unwrap();
    cmd.env_remove("RECOVERY_MAX_RETRY_ATTEMPTS")
        .env_remove("RECOVERY_LOG_LEVEL")
        .env("NO_COLOR", "1");
    cmd
}

#[test]
fn test_version_flag() {
    cli()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("recovery-engine"));
}

#[test]
fn test_classify_human_output() {
    cli()
        .args(["classify", "--operation", "fetch_profile", "Connection refused"])
        .assert()
        .success()
        .stdout(predicate::str::contains("network_error"))
        .stdout(predicate::str::contains("retry -> circuit_breaker -> fallback -> abort"));
}

#[test]
fn test_classify_json_output() {
    let output = cli()
        .args([
            "--format",
            "json",
            "classify",
            "--param",
            "token=secret",
            "--param",
            "user=bob",
            "request timed out",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["details"]["kind"], "timeout");
    assert_eq!(json["details"]["category"], "performance");
    assert_eq!(json["details"]["context"]["user"], "bob");
    assert!(json["details"]["context"].get("token").is_none());
    assert_eq!(json["strategies"][0], "retry");
}

#[test]
fn test_policy_for_single_kind() {
    cli()
        .args(["policy", "--kind", "disk-full"])
        .assert()
        .success()
        .stdout(predicate::str::contains("disk_full"))
        .stdout(predicate::str::contains("escalation -> abort"));
}

#[test]
fn test_policy_marks_unmapped_kinds() {
    cli()
        .args(["policy", "--kind", "invalid_input"])
        .assert()
        .success()
        .stdout(predicate::str::contains("(default)"));
}

#[test]
fn test_unknown_kind_is_rejected() {
    cli()
        .args(["policy", "--kind", "gremlins"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown error kind"));
}

#[test]
fn test_backoff_json_schedule() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("recovery.yaml");
    fs::write(
        &path,
        "recovery:\n  base_delay_ms: 100\n  max_delay_ms: 500\n  jitter: false\n",
    )
    .unwrap();

    let output = cli()
        .args(["--format", "json", "--config"])
        .arg(&path)
        .args(["backoff", "--attempts", "4"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["delays_ms"], serde_json::json!([100, 200, 400, 500]));
    assert_eq!(json["jitter"], false);
}

#[test]
fn test_check_config_valid() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("recovery.toml");
    fs::write(&path, "[recovery]\nmax_retry_attempts = 2\n").unwrap();

    cli()
        .arg("check-config")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"));
}

#[test]
fn test_check_config_invalid_values() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("recovery.yaml");
    fs::write(&path, "recovery:\n  backoff_multiplier: 0.5\n").unwrap();

    cli()
        .arg("check-config")
        .arg(&path)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("backoff_multiplier"));
}

#[test]
fn test_check_config_invalid_policy() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("recovery.yaml");
    fs::write(&path, "policies:\n  timeout: [abort, retry]\n").unwrap();

    cli()
        .arg("check-config")
        .arg(&path)
        .assert()
        .code(3)
        .stderr(predicate::str::contains("abort must be the last strategy"));
}

#[test]
fn test_check_config_missing_file() {
    cli()
        .args(["check-config", "/definitely/not/here.yaml"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_generate_completion() {
    cli()
        .args(["generate-completion", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("recovery-engine"));
}
