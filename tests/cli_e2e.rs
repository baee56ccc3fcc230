//! End-to-end CLI tests for the harvester binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

mod support;
use support::socket_guard::start_mock_server_or_skip;
use harvester_core::HashStore;
use harvester_core::queue::Fingerprint;
use support::{
    CREATOR_NAME, DIRECTORY, PAYLOAD, config, mount_files, mount_page, page, payload_response,
    published, stem,
};

fn harvester() -> Command {
    let mut cmd = Command::cargo_bin("harvester").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_binary_help_displays_usage() {
    harvester()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Mirror creator posts"))
        .stdout(predicate::str::contains("--queue-capacity"));
}

#[test]
fn test_binary_version_displays_version() {
    harvester()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("harvester"));
}

#[test]
fn test_binary_invalid_flag_returns_error() {
    harvester()
        .arg("--invalid-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_binary_missing_config_fails_with_guidance() {
    let temp = TempDir::new().unwrap();
    harvester()
        .arg("--config")
        .arg(temp.path().join("absent.json"))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("config file not found"));
}

#[test]
fn test_binary_default_config_location_is_reported() {
    let temp = TempDir::new().unwrap();
    harvester()
        .env("XDG_CONFIG_HOME", temp.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("harvester/config.json"));
}

#[test]
fn test_binary_malformed_config_fails() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("config.json");
    std::fs::write(&path, "{ not json").unwrap();
    harvester()
        .arg("--config")
        .arg(&path)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("failed to load"));
}

#[test]
fn test_binary_config_without_sources_fails() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("config.json");
    std::fs::write(&path, "{}").unwrap();
    harvester()
        .arg("--config")
        .arg(&path)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("sources"));
}

#[test]
fn test_binary_full_run_skips_cached_and_exits_zero() {
    let Some(server) = tokio_test::block_on(start_mock_server_or_skip()) else {
        return;
    };
    let temp = TempDir::new().unwrap();
    let mut config = config(&server, temp.path());
    config.min_free_bytes = 0;
    config.min_free_fraction = 0.0;

    tokio_test::block_on(async {
        mount_page(&server, 0, page(0..3)).await;
        mount_files(&server, payload_response()).await;

        let store = HashStore::open(&config.hash_cache).await.unwrap();
        let (known, _) = Fingerprint::from_source_path(&format!("{}.png", stem(1))).unwrap();
        store.insert(DIRECTORY, CREATOR_NAME, &known).await.unwrap();
    });

    let config_path = temp.path().join("config.json");
    std::fs::write(&config_path, serde_json::to_vec_pretty(&config).unwrap()).unwrap();

    harvester()
        .arg("--config")
        .arg(&config_path)
        .args(["-c", "2", "-q"])
        .assert()
        .success();

    let files = published(temp.path());
    assert_eq!(files.len(), 2);
    for file in files {
        assert_eq!(std::fs::read(file).unwrap(), PAYLOAD);
    }
    assert!(temp.path().join("transfers.txt").exists());
}
