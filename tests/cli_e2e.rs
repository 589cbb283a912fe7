//! End-to-end CLI tests for the ipsw-downloader binary.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

mod support;
use support::socket_guard::start_mock_server_or_skip;

fn write_config(dir: &Path, api_base_url: &str, extra: &str) -> std::path::PathBuf {
    let config_path = dir.join("config.toml");
    let body = format!(
        "api_base_url = {:?}\nstorage_dir = {:?}\nprogress_log = {:?}\ndetailed_log = {:?}\n{extra}",
        api_base_url,
        dir.join("ipsw").display().to_string(),
        dir.join("logs").join("download_progress.log").display().to_string(),
        dir.join("logs").join("detailed_logging.log").display().to_string(),
    );
    std::fs::write(&config_path, body).unwrap();
    config_path
}

/// Test that --help displays usage information and exits with code 0.
#[test]
fn test_binary_help_displays_usage() {
    let mut cmd = Command::cargo_bin("ipsw-downloader").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Mirror the latest firmware"))
        .stdout(predicate::str::contains("--once"));
}

/// Test that --version displays version and exits with code 0.
#[test]
fn test_binary_version_displays_version() {
    let mut cmd = Command::cargo_bin("ipsw-downloader").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("ipsw-downloader"));
}

/// Test that invalid flags cause non-zero exit.
#[test]
fn test_binary_invalid_flag_returns_error() {
    let mut cmd = Command::cargo_bin("ipsw-downloader").unwrap();
    cmd.arg("--invalid-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_binary_concurrency_out_of_range_is_rejected() {
    let mut cmd = Command::cargo_bin("ipsw-downloader").unwrap();
    cmd.args(["--concurrency", "0", "--once"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("concurrency"));
}

#[test]
fn test_binary_missing_config_file_fails() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("nope.toml");

    let mut cmd = Command::cargo_bin("ipsw-downloader").unwrap();
    cmd.arg("--config")
        .arg(&missing)
        .arg("--once")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load configuration"));
}

#[test]
fn test_binary_invalid_config_value_fails() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(temp_dir.path(), "http://127.0.0.1:9", "concurrency = 0\n");

    let mut cmd = Command::cargo_bin("ipsw-downloader").unwrap();
    cmd.arg("--config")
        .arg(&config_path)
        .arg("--once")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid config value for `concurrency`"));
}

#[test]
fn test_binary_unknown_config_key_fails() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(temp_dir.path(), "http://127.0.0.1:9", "smtp_server = \"x\"\n");

    let mut cmd = Command::cargo_bin("ipsw-downloader").unwrap();
    cmd.arg("--config")
        .arg(&config_path)
        .arg("--once")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to parse config file"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_binary_once_with_empty_catalog_writes_detailed_log() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/devices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(temp_dir.path(), &mock_server.uri(), "");
    let detailed_log = temp_dir.path().join("logs").join("detailed_logging.log");

    let output = tokio::task::spawn_blocking(move || {
        Command::cargo_bin("ipsw-downloader")
            .unwrap()
            .arg("--config")
            .arg(&config_path)
            .arg("--once")
            .env_remove("RUST_LOG")
            .output()
            .unwrap()
    })
    .await
    .unwrap();

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(temp_dir.path().join("ipsw").is_dir());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Starting to get the latest IPSW files..."), "{stderr}");

    let log = std::fs::read_to_string(&detailed_log).unwrap();
    assert!(
        log.contains(" - INFO - All downloads have been already completed. No further action required."),
        "{log}"
    );
}
