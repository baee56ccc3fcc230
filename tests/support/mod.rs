//! Shared helpers for integration tests.

#![allow(dead_code)]

pub mod socket_guard;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use harvester_core::config::{CreatorConfig, ServiceConfig, SourceConfig};
use harvester_core::{DiskProbe, PipelineConfig};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const GB: u64 = 1_000_000_000;
pub const CREATOR_ID: &str = "42";
pub const CREATOR_NAME: &str = "Alice";
pub const DIRECTORY: &str = "Patreon";
pub const PAYLOAD: &[u8] = b"file-content-bytes";

/// Disk probe whose reading tests can change mid-run.
#[derive(Debug)]
pub struct AdjustableProbe(AtomicU64);

impl AdjustableProbe {
    pub fn new(free: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(free)))
    }

    pub fn set(&self, free: u64) {
        self.0.store(free, Ordering::SeqCst);
    }
}

impl DiskProbe for AdjustableProbe {
    fn available_space(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

/// Fingerprint-length file stem for item `n`.
pub fn stem(n: usize) -> String {
    format!("{n:030x}")
}

/// One post record whose primary file is item `n`.
pub fn record(n: usize) -> Value {
    json!({ "file": { "path": format!("/ab/cd/{}.png", stem(n)) }, "attachments": [] })
}

pub fn page(items: impl IntoIterator<Item = usize>) -> Value {
    Value::Array(items.into_iter().map(record).collect())
}

/// Fast config for one creator on `server`, rooted in `root`.
pub fn config(server: &MockServer, root: &Path) -> PipelineConfig {
    PipelineConfig {
        final_root: root.join("Files"),
        scratch_root: root.join("Temp"),
        hash_cache: root.join("hashes.json"),
        queue_capacity: 200,
        initial_workers: 2,
        min_workers: 1,
        max_workers: 2,
        producer_concurrency: 1,
        guard_interval_ms: 20,
        max_attempts: 5,
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 50,
        retry_max_jitter_ms: 0,
        api_spacing_ms: 0,
        connect_timeout_secs: 5,
        request_timeout_secs: 10,
        sources: vec![SourceConfig {
            name: "test".to_string(),
            base_url: format!("{}/api/v1", server.uri()),
            file_url: format!("{}/data", server.uri()),
            session_env: None,
            services: vec![ServiceConfig {
                name: "patreon".to_string(),
                directory: DIRECTORY.to_string(),
            }],
            creators: vec![CreatorConfig {
                service: "patreon".to_string(),
                id: CREATOR_ID.to_string(),
                name: Some(CREATOR_NAME.to_string()),
            }],
            favorites: false,
        }],
        ..PipelineConfig::default()
    }
}

/// Serves `body` for the listing page at `offset`.
pub async fn mount_page(server: &MockServer, offset: usize, body: Value) {
    Mock::given(method("GET"))
        .and(path(format!("/api/v1/patreon/user/{CREATOR_ID}/posts")))
        .and(query_param("o", offset.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// Serves [`PAYLOAD`] for every file path.
pub async fn mount_files(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(wiremock::matchers::path_regex(r"^/data/ab/cd/[0-9a-f]+\.png$"))
        .respond_with(response)
        .mount(server)
        .await;
}

pub fn payload_response() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_bytes(PAYLOAD)
}

/// Requests received for listing page `offset`.
pub async fn page_requests(server: &MockServer, offset: usize) -> usize {
    let query = format!("o={offset}");
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path().ends_with("/posts") && r.url.query() == Some(query.as_str()))
        .count()
}

/// Requests received for files.
pub async fn file_requests(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path().starts_with("/data/"))
        .count()
}

/// Published files of the test creator.
pub fn published(root: &Path) -> Vec<std::path::PathBuf> {
    let dir = root.join("Files").join(DIRECTORY).join(CREATOR_NAME);
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// File host that announces `total` body bytes, writes `sent` of them,
/// signals, then stalls with the connection open.
pub async fn stalled_file_server(
    total: usize,
    sent: usize,
) -> Option<(String, oneshot::Receiver<()>)> {
    if socket_guard::should_skip_socket_bound_test() {
        return None;
    }
    let listener = TcpListener::bind("127.0.0.1:0").await.ok()?;
    let addr = listener.local_addr().ok()?;
    let (signal, written) = oneshot::channel();
    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let mut request = Vec::new();
        let mut buf = [0_u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => request.extend_from_slice(&buf[..n]),
            }
        }
        let head = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: image/png\r\ncontent-length: {total}\r\n\r\n"
        );
        if socket.write_all(head.as_bytes()).await.is_err()
            || socket.write_all(&vec![0_u8; sent]).await.is_err()
        {
            return;
        }
        let _ = socket.flush().await;
        let _ = signal.send(());
        tokio::time::sleep(Duration::from_secs(30)).await;
    });
    Some((format!("http://{addr}"), written))
}

/// Every regular file below `dir`.
pub fn files_under(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                found.push(path);
            }
        }
    }
    found
}
