//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    assert_cmd::Command::cargo_bin("vztrack").expect("binary should build")
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("vztrack"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("vztrack"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn help_lists_every_subcommand() {
    let mut cmd = cli_cmd();
    let assert = cmd.arg("--help").assert().success();
    let output = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    for sub in ["list-ports", "detect", "markers", "measure", "check", "convert"] {
        assert!(output.contains(sub), "--help should mention {sub}");
    }
}

#[test]
fn list_ports_json_returns_valid_json() {
    let mut cmd = cli_cmd();
    let output = cmd
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    // In environments without serial ports this still must emit a JSON
    // array (possibly empty) on stdout.
    let stdout = String::from_utf8_lossy(&output.stdout);
    if output.status.success() {
        let parsed: serde_json::Value =
            serde_json::from_str(&stdout).expect("stdout should be JSON");
        assert!(parsed.is_array());
    }
}

#[test]
fn check_clean_setup_exits_zero() {
    let dir = tempdir().expect("tempdir should be created");
    let mut cmd = cli_cmd();
    cmd.args([
        "--settings-dir",
        dir.path().to_str().expect("utf-8 path"),
        "check",
        "--freq",
        "10",
        "--markers",
        "1:1,1:2,2:1",
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("OK"));
}

#[test]
fn check_invalid_setup_exits_nonzero_with_issue() {
    let dir = tempdir().expect("tempdir should be created");
    let mut cmd = cli_cmd();
    cmd.args([
        "--settings-dir",
        dir.path().to_str().expect("utf-8 path"),
        "check",
        "--freq",
        "4600",
        "--markers",
        &(1..=64)
            .map(|i| format!("1:{i}:2"))
            .collect::<Vec<_>>()
            .join(","),
    ])
    .assert()
    .failure()
    .stdout(predicate::str::contains("Maximum achievable rate"));
}

#[test]
fn check_json_emits_issue_list() {
    let dir = tempdir().expect("tempdir should be created");
    let mut cmd = cli_cmd();
    let output = cmd
        .args([
            "--settings-dir",
            dir.path().to_str().expect("utf-8 path"),
            "check",
            "--json",
            "--freq",
            "200",
            "--sot",
            "15",
            "--markers",
            &(1..=10).map(|i| format!("1:{i}")).collect::<Vec<_>>().join(","),
        ])
        .output()
        .expect("command should execute");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let parsed: serde_json::Value = serde_json::from_str(&stdout).expect("stdout should be JSON");
    let issues = parsed.as_array().expect("issue list");
    assert!(issues.iter().any(|i| {
        i["message"]
            .as_str()
            .is_some_and(|m| m.contains("per-target"))
    }));
}

#[test]
fn convert_missing_file_fails_cleanly() {
    let dir = tempdir().expect("tempdir should be created");
    let missing = dir.path().join("nope.dmslog8");

    let mut cmd = cli_cmd();
    cmd.args(["convert", missing.to_str().expect("utf-8 path")])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error:"));
}

#[test]
fn convert_rejects_bad_signature() {
    let dir = tempdir().expect("tempdir should be created");
    let bogus = dir.path().join("bogus.dmslog8");
    fs::write(&bogus, vec![0u8; 128]).expect("write test file");

    let mut cmd = cli_cmd();
    cmd.args(["convert", bogus.to_str().expect("utf-8 path")])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid capture"));
}

#[test]
fn detect_unknown_port_fails_without_panic() {
    let mut cmd = cli_cmd();
    cmd.args(["detect", "/dev/does-not-exist-vztrack"])
        .assert()
        .code(predicate::in_iter([0, 1]));
}
