//! Moving finished files to remote storage with `rclone`.
//!
//! Final storage only ever holds complete files, so a move can run while
//! workers keep publishing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::PipelineState;
use crate::store::{RcloneLister, StorageLister, StoreError};
use crate::units::format_bytes;

/// Fewest parallel transfers recommended.
pub const MIN_TRANSFERS: usize = 4;
/// Most parallel transfers recommended.
pub const MAX_TRANSFERS: usize = 32;
const MIN_FILES: u64 = 100;
const MAX_FILES: u64 = 50_000;

/// Recommended `--transfers` for `file_count` files, on a log scale between
/// `min` at `min_files` and `max` at `max_files`.
///
/// ```
/// use harvester_core::pipeline::calculate_transfers;
///
/// assert_eq!(calculate_transfers(10, 4, 32, 100, 50_000), 4);
/// assert_eq!(calculate_transfers(50_000, 4, 32, 100, 50_000), 32);
/// ```
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn calculate_transfers(
    file_count: u64,
    min: usize,
    max: usize,
    min_files: u64,
    max_files: u64,
) -> usize {
    if file_count == 0 || min_files == 0 || max_files <= min_files {
        return min;
    }
    let position = ((file_count as f64).ln() - (min_files as f64).ln())
        / ((max_files as f64).ln() - (min_files as f64).ln());
    let raw = (min as f64 + (max as f64 - min as f64) * position).round();
    (raw.max(min as f64) as usize).min(max)
}

/// Recommended transfers with the default bounds.
#[must_use]
pub fn recommended_transfers(file_count: u64) -> usize {
    calculate_transfers(file_count, MIN_TRANSFERS, MAX_TRANSFERS, MIN_FILES, MAX_FILES)
}

/// File count and total size of a directory tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Regular files found.
    pub files: u64,
    /// Sum of their sizes.
    pub bytes: u64,
}

/// Walks `root` and totals its regular files. A missing root is empty.
///
/// # Errors
///
/// Returns the first IO error other than a missing root.
pub async fn scan_tree(root: &Path) -> std::io::Result<TreeStats> {
    let mut stats = TreeStats::default();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                stats.files += 1;
                stats.bytes += entry.metadata().await?.len();
            }
        }
    }
    Ok(stats)
}

/// Background mover from final storage to an rclone remote.
#[derive(Debug, Clone)]
pub struct RemoteSync {
    binary: PathBuf,
    remote: String,
    final_root: PathBuf,
    threshold_bytes: u64,
    interval: Duration,
}

impl RemoteSync {
    /// Creates a mover for `final_root`.
    #[must_use]
    pub fn new(
        binary: impl Into<PathBuf>,
        remote: impl Into<String>,
        final_root: impl Into<PathBuf>,
        threshold_bytes: u64,
        interval: Duration,
    ) -> Self {
        Self {
            binary: binary.into(),
            remote: remote.into(),
            final_root: final_root.into(),
            threshold_bytes,
            interval,
        }
    }

    fn remote_path(&self, dir: &str) -> String {
        format!("{}:{dir}", self.remote.trim_end_matches(':'))
    }

    /// Creates every directory in `directories` missing on the remote.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Listing`] when listing or `mkdir` fails.
    #[instrument(skip(self, directories))]
    pub async fn ensure_directories(&self, directories: &[String]) -> Result<usize, StoreError> {
        let lister = RcloneLister::new(&self.binary, &self.remote);
        let existing = lister.list_dirs("").await?;
        let mut created = 0;
        for dir in directories {
            if existing.iter().any(|name| name == dir) {
                continue;
            }
            let target = self.remote_path(dir);
            self.rclone(&["mkdir", &target]).await?;
            info!(%target, "created missing remote directory");
            created += 1;
        }
        Ok(created)
    }

    /// Moves everything under final storage to the remote.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Listing`] when rclone cannot be run or fails.
    pub async fn move_now(&self, transfers: usize) -> Result<(), StoreError> {
        let source = self.final_root.display().to_string();
        let target = self.remote_path("");
        let transfers = transfers.to_string();
        self.rclone(&[
            "move",
            &source,
            &target,
            "--transfers",
            &transfers,
            "--delete-empty-src-dirs",
        ])
        .await
    }

    async fn rclone(&self, args: &[&str]) -> Result<(), StoreError> {
        debug!(binary = %self.binary.display(), ?args, "running rclone");
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| StoreError::listing(self.remote_path(""), e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(StoreError::listing(self.remote_path(""), stderr.trim().to_string()))
        }
    }

    /// Checks final storage every interval and moves it once it holds at
    /// least the threshold. Ends when the pipeline halts.
    pub fn spawn(self, state: Arc<PipelineState>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(self.interval) => {}
                    () = state.halted() => return,
                }
                let stats = match scan_tree(&self.final_root).await {
                    Ok(stats) => stats,
                    Err(e) => {
                        warn!(error = %e, "could not scan final storage");
                        continue;
                    }
                };
                if stats.bytes < self.threshold_bytes {
                    continue;
                }
                let transfers = recommended_transfers(stats.files);
                info!(
                    files = stats.files,
                    size = %format_bytes(stats.bytes),
                    transfers,
                    "moving final storage to remote"
                );
                if let Err(e) = self.move_now(transfers).await {
                    warn!(error = %e, "remote move failed");
                }
            }
        })
    }
}
