//! CLI surface tests: argument parsing, configuration failures, and the
//! operator utilities that do not need a live tracker.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

fn kiln() -> Command {
    let mut cmd = cargo_bin_cmd!("kiln");
    // Keep host environment credentials out of the tests.
    for key in [
        "GITHUB_TOKEN",
        "GITHUB_ENTERPRISE_HOST",
        "GITHUB_ENTERPRISE_TOKEN",
        "GITHUB_ENTERPRISE_USER",
        "PROJECT_URLS",
        "ALLOWED_USERNAME",
    ] {
        cmd.env_remove(key);
    }
    cmd
}

#[test]
fn help_and_version() {
    kiln().arg("--help").assert().success();
    kiln().arg("--version").assert().success();
}

#[test]
fn run_refuses_to_start_without_credentials() {
    let dir = TempDir::new().unwrap();
    kiln()
        .arg("--kiln-dir")
        .arg(dir.path())
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("GITHUB_TOKEN"));
}

#[test]
fn run_refuses_conflicting_hosts() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("config"),
        "GITHUB_TOKEN=x\nGITHUB_ENTERPRISE_HOST=github.example.com\n\
         GITHUB_ENTERPRISE_TOKEN=y\nGITHUB_ENTERPRISE_USER=bot\n\
         PROJECT_URLS=https://github.com/orgs/acme/projects/1\n\
         ALLOWED_USERNAME=octocat\n",
    )
    .unwrap();
    kiln()
        .arg("--kiln-dir")
        .arg(dir.path())
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("mutually exclusive"));
}

#[test]
fn logs_with_no_runs_reports_empty() {
    let dir = TempDir::new().unwrap();
    kiln()
        .arg("--kiln-dir")
        .arg(dir.path())
        .arg("logs")
        .assert()
        .success()
        .stdout(predicate::str::contains("no run logs yet"));
}

#[test]
fn logs_lists_run_files() {
    let dir = TempDir::new().unwrap();
    let log_dir = dir.path().join("logs/github.com/acme/web/42");
    std::fs::create_dir_all(&log_dir).unwrap();
    std::fs::write(log_dir.join("research-20260801-1200.log"), "line\n").unwrap();

    kiln()
        .arg("--kiln-dir")
        .arg(dir.path())
        .arg("logs")
        .assert()
        .success()
        .stdout(predicate::str::contains("research-20260801-1200.log"));
}

#[test]
fn logs_tail_prints_latest_for_issue() {
    let dir = TempDir::new().unwrap();
    let log_dir = dir.path().join("logs/github.com/acme/web/42");
    std::fs::create_dir_all(&log_dir).unwrap();
    std::fs::write(
        log_dir.join("research-20260801-1200.log"),
        "first\nsecond\nthird\n",
    )
    .unwrap();

    kiln()
        .arg("--kiln-dir")
        .arg(dir.path())
        .args(["logs", "--issue", "42", "--tail", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("third").and(predicate::str::contains("first").not()));
}

#[test]
fn reset_rejects_malformed_issue_refs() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("config"),
        "GITHUB_TOKEN=x\nPROJECT_URLS=https://github.com/orgs/acme/projects/1\n\
         ALLOWED_USERNAME=octocat\n",
    )
    .unwrap();
    kiln()
        .arg("--kiln-dir")
        .arg(dir.path())
        .args(["reset", "not-an-issue"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("host/owner/repo#N"));
}
