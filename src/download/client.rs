//! HTTP client wrapper for listing requests and streamed file transfers.
//!
//! One [`HttpClient`] is built per run and cloned into every task, so all
//! requests share one connection pool.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{COOKIE, RETRY_AFTER};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, DEFAULT_CHUNK_SIZE, READ_TIMEOUT_SECS};
use super::error::DownloadError;
use crate::pipeline::PipelineState;
use crate::user_agent;

/// Outcome of a completed transfer to the scratch area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    /// Scratch file holding the body.
    pub path: PathBuf,
    /// Bytes written.
    pub bytes: u64,
    /// Length announced by the server, when known.
    pub content_length: Option<u64>,
}

/// Shared HTTP client.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    chunk_size: usize,
}

impl HttpClient {
    /// Creates a client with the default 30s connect and 300s total timeouts.
    ///
    /// # Errors
    ///
    /// Returns the builder error when the TLS backend cannot be initialised.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeouts(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(READ_TIMEOUT_SECS),
        )
    }

    /// Creates a client with explicit timeouts.
    ///
    /// # Errors
    ///
    /// Returns the builder error when the TLS backend cannot be initialised.
    pub fn with_timeouts(
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .gzip(true)
            .user_agent(user_agent::default_user_agent())
            .build()?;
        Ok(Self {
            client,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    /// Sets the write-buffer size used by [`stream_to_path`](Self::stream_to_path).
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Fetches a JSON document, sending `session` as the session cookie.
    ///
    /// # Errors
    ///
    /// Returns transport, status or decode errors, each carrying the URL.
    #[instrument(level = "debug", skip(self, session))]
    pub async fn get_json(
        &self,
        url: &str,
        session: Option<&str>,
    ) -> Result<serde_json::Value, DownloadError> {
        let response = self.send(url, session).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| DownloadError::network(url, e))?;
        serde_json::from_slice(&body).map_err(|e| DownloadError::decode(url, e.to_string()))
    }

    /// Streams `url` into `dest`, creating parent directories as needed.
    ///
    /// The halt signal is observed between chunks. On any failure, including
    /// interruption and a length mismatch, the partial file is removed.
    ///
    /// # Errors
    ///
    /// Returns the transport, IO, integrity or interruption error.
    #[instrument(level = "debug", skip(self, state), fields(dest = %dest.display()))]
    pub async fn stream_to_path(
        &self,
        url: &str,
        dest: &Path,
        state: &PipelineState,
    ) -> Result<Transfer, DownloadError> {
        let response = self.send(url, None).await?;
        let content_length = response.content_length();

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent, e))?;
        }
        let file = File::create(dest)
            .await
            .map_err(|e| DownloadError::io(dest, e))?;

        let result = self
            .write_body(file, response, url, dest, content_length, state)
            .await;
        if result.is_err() {
            debug!(path = %dest.display(), "removing partial scratch file");
            let _ = tokio::fs::remove_file(dest).await;
        }
        let bytes = result?;

        Ok(Transfer {
            path: dest.to_path_buf(),
            bytes,
            content_length,
        })
    }

    async fn write_body(
        &self,
        file: File,
        response: reqwest::Response,
        url: &str,
        dest: &Path,
        content_length: Option<u64>,
        state: &PipelineState,
    ) -> Result<u64, DownloadError> {
        let mut writer = BufWriter::with_capacity(self.chunk_size, file);
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                () = state.halted() => return Err(DownloadError::interrupted(url)),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| DownloadError::network(url, e))?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| DownloadError::io(dest, e))?;
            written += chunk.len() as u64;
        }

        writer
            .flush()
            .await
            .map_err(|e| DownloadError::io(dest, e))?;
        writer
            .get_ref()
            .sync_all()
            .await
            .map_err(|e| DownloadError::io(dest, e))?;

        if let Some(expected) = content_length
            && expected != written
        {
            return Err(DownloadError::integrity(dest, expected, written));
        }
        Ok(written)
    }

    async fn send(
        &self,
        url: &str,
        session: Option<&str>,
    ) -> Result<reqwest::Response, DownloadError> {
        Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;

        let mut request = self.client.get(url);
        if let Some(session) = session {
            request = request.header(COOKIE, format!("session={session}"));
        }
        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::network(url, e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Err(DownloadError::http_status_with_retry_after(
                url,
                status.as_u16(),
                retry_after,
            ));
        }
        Ok(response)
    }
}
