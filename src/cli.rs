//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use harvester_core::PipelineConfig;

/// Mirror creator posts from content-hosting services to local storage.
///
/// Harvester pages through every favorited or configured creator, skips
/// files whose content fingerprint is already stored and downloads the
/// rest with a self-tuning worker pool.
#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Path to the JSON config file (default: $XDG_CONFIG_HOME/harvester/config.json)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Initial download workers (1-100)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: Option<u8>,

    /// Upper bound for the worker pool (1-100)
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub max_workers: Option<u8>,

    /// Capacity of the work queue (1-1000000)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=1_000_000))]
    pub queue_capacity: Option<u64>,

    /// Attempts per request including the first (1-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(1..=10))]
    pub max_retries: Option<u8>,

    /// Rebuild known fingerprints from storage before fetching
    #[arg(long)]
    pub reconcile: bool,

    /// Disable moving files to the rclone remote
    #[arg(long)]
    pub no_sync: bool,
}

impl Args {
    /// Applies flag overrides on top of file values.
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(concurrency) = self.concurrency {
            config.initial_workers = usize::from(concurrency);
        }
        if let Some(max) = self.max_workers {
            config.max_workers = usize::from(max);
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = usize::try_from(capacity).unwrap_or(usize::MAX);
        }
        if let Some(attempts) = self.max_retries {
            config.max_attempts = u32::from(attempts);
        }
        if self.reconcile {
            config.reconcile = true;
        }
        if self.no_sync {
            config.sync.enabled = false;
        }
    }
}
