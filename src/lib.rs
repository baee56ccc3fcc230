//! Harvester Core Library
//!
//! A bounded producer/consumer pipeline that pages through creator post
//! listings on content-hosting services and downloads every referenced
//! file exactly once.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`config`] - JSON configuration and validation
//! - [`download`] - HTTP client, retry policy and the resizable worker pool
//! - [`fetch`] - Paginated metadata fetching with queue backpressure
//! - [`pipeline`] - Run state, concurrency controller and supervisor
//! - [`queue`] - Bounded in-memory work queue and item descriptors
//! - [`resource`] - Free-space guard
//! - [`store`] - Persisted content-fingerprint set

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod download;
pub mod fetch;
pub mod pipeline;
pub mod queue;
pub mod resource;
pub mod store;
pub mod units;
mod user_agent;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use config::{ConfigError, PipelineConfig, default_config_path};
pub use download::{
    DEFAULT_CONCURRENCY, DownloadWorkerPool, EngineError, HttpClient, RateLimiter, RetryPolicy,
};
pub use fetch::{MetadataFetcher, SourceApi};
pub use pipeline::{HaltReason, PipelineError, PipelineState, PipelineSummary, PipelineSupervisor};
pub use queue::{BoundedQueue, ItemDescriptor, QueueError};
pub use resource::{DiskFloor, DiskProbe, ResourceGuard};
pub use store::{HashStore, StoreError};
