//! Constants for the download module (timeouts, transfer sizes).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default total request timeout (5 minutes for large files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Default write-buffer size for streamed transfers (3 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 3 * 1024 * 1024;

/// Maximum honoured Retry-After value (1 hour).
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);
