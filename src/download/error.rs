//! Error types for page fetches and file transfers.
//!
//! Every variant carries the URL or path it concerns; there are no blanket
//! `From` conversions because the source errors lack that context.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while talking to a source API or streaming a file.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Transport-level failure (DNS, connect, reset, TLS, truncated body).
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL being fetched.
        url: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The request or a body read exceeded its deadline.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// The server answered with a non-success status.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned the status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// Raw `Retry-After` header, if the server sent one.
        retry_after: Option<String>,
    },

    /// Local filesystem failure.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path being written, created or renamed.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The URL could not be parsed or built.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
    },

    /// Received byte count differs from the advertised content length.
    #[error(
        "integrity check failed for {path}: expected {expected_bytes} bytes, got {actual_bytes}"
    )]
    Integrity {
        /// Scratch file that failed verification.
        path: PathBuf,
        /// Bytes announced by the server.
        expected_bytes: u64,
        /// Bytes actually written.
        actual_bytes: u64,
    },

    /// A listing response could not be decoded.
    #[error("malformed response from {url}: {message}")]
    Decode {
        /// The URL whose body was malformed.
        url: String,
        /// Decoder message.
        message: String,
    },

    /// The pipeline halted while the operation was in flight.
    #[error("interrupted while fetching {url}")]
    Interrupted {
        /// The URL being fetched when the halt was observed.
        url: String,
    },

    /// Transient failures persisted through every allowed attempt.
    #[error("gave up on {url} after {attempts} attempts: {last_error}")]
    RetryExhausted {
        /// The URL that kept failing.
        url: String,
        /// Attempts made, including the first.
        attempts: u32,
        /// Message of the final failure.
        last_error: String,
    },
}

impl DownloadError {
    /// Creates a network error from a client error.
    ///
    /// Client-side timeouts are reported as [`DownloadError::Timeout`].
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            return Self::Timeout { url: url.into() };
        }
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error carrying the `Retry-After` header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates an integrity mismatch error.
    pub fn integrity(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Integrity {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Creates a decode error.
    pub fn decode(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates an interruption error.
    pub fn interrupted(url: impl Into<String>) -> Self {
        Self::Interrupted { url: url.into() }
    }

    /// Wraps the last failure of an exhausted retry loop.
    pub fn retry_exhausted(url: impl Into<String>, attempts: u32, last: &DownloadError) -> Self {
        Self::RetryExhausted {
            url: url.into(),
            attempts,
            last_error: last.to_string(),
        }
    }

    /// Returns the `Retry-After` header value, if this error carries one.
    #[must_use]
    pub fn retry_after(&self) -> Option<&str> {
        match self {
            Self::HttpStatus { retry_after, .. } => retry_after.as_deref(),
            _ => None,
        }
    }
}
