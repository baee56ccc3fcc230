//! HTTP transfers, retry classification and the download worker pool.
//!
//! # Features
//!
//! - Streaming transfers into a scratch tree with halt checks between chunks
//! - Closed [`ErrorKind`] classification deciding retries and log severity
//! - Exponential backoff with jitter, honouring `Retry-After`
//! - Per-domain request spacing for listing endpoints
//! - Atomic publish from scratch into final storage
//! - A worker pool resizable at runtime through a [`PoolHandle`]

mod client;
pub mod constants;
mod engine;
mod error;
pub mod rate_limiter;
mod retry;

pub use client::{HttpClient, Transfer};
pub use engine::{
    Claim, DEFAULT_CONCURRENCY, DownloadWorkerPool, EngineError, FinalizeError, InFlight, Outcome,
    PoolHandle, StorageLayout, WorkerContext, process, publish,
};
pub use error::DownloadError;
pub use rate_limiter::{RateLimiter, extract_domain, parse_retry_after};
pub use retry::{
    DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY, DEFAULT_MAX_JITTER, ErrorKind,
    RetryDecision, RetryPolicy, classify_error, retry_with_policy,
};
