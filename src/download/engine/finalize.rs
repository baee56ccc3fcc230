//! Publishing a finished scratch file into final storage.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::queue::ItemDescriptor;

/// Final and scratch roots. Both must live on the same volume so that
/// publishing is a single rename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    /// Root of published files.
    pub final_root: PathBuf,
    /// Root of in-flight temp files, mirroring `final_root`.
    pub scratch_root: PathBuf,
}

impl StorageLayout {
    /// Creates a layout.
    #[must_use]
    pub fn new(final_root: impl Into<PathBuf>, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            final_root: final_root.into(),
            scratch_root: scratch_root.into(),
        }
    }

    /// Scratch path of `item`.
    #[must_use]
    pub fn scratch_path(&self, item: &ItemDescriptor) -> PathBuf {
        item.scratch_path(&self.scratch_root)
    }

    /// Final path of `item`.
    #[must_use]
    pub fn final_path(&self, item: &ItemDescriptor) -> PathBuf {
        item.final_path(&self.final_root)
    }
}

/// Reasons publishing failed. None of them is retried.
#[derive(Debug, Error)]
pub enum FinalizeError {
    /// The scratch file disappeared between transfer and rename.
    #[error("scratch file vanished before publish: {path}")]
    ScratchMissing {
        /// The missing scratch file.
        path: PathBuf,
    },

    /// Creating the final directory or renaming failed.
    #[error("could not publish {path}: {source}")]
    Io {
        /// Path being created or renamed to.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The published file does not have the transferred size.
    #[error("published file {path} has {actual} bytes, expected {expected}")]
    SizeMismatch {
        /// Final path.
        path: PathBuf,
        /// Bytes transferred.
        expected: u64,
        /// Bytes found after publishing.
        actual: u64,
    },
}

/// Moves `scratch` to `final_path` and checks the published size.
///
/// A size mismatch removes the published file so final storage never holds
/// a short file. When the final directory disappears before the rename (a
/// concurrent remote move prunes empty directories) it is recreated once.
///
/// # Errors
///
/// Returns [`FinalizeError::ScratchMissing`] when the scratch file is gone,
/// otherwise the IO or size failure.
pub async fn publish(scratch: &Path, final_path: &Path, expected: u64) -> Result<(), FinalizeError> {
    publish_with(scratch, final_path, expected, || {}).await
}

async fn publish_with(
    scratch: &Path,
    final_path: &Path,
    expected: u64,
    mut before_rename: impl FnMut(),
) -> Result<(), FinalizeError> {
    let mut retried = false;
    loop {
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| FinalizeError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        before_rename();

        match tokio::fs::rename(scratch, final_path).await {
            Ok(()) => break,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if !tokio::fs::try_exists(scratch).await.unwrap_or(false) {
                    return Err(FinalizeError::ScratchMissing {
                        path: scratch.to_path_buf(),
                    });
                }
                if retried {
                    return Err(FinalizeError::Io {
                        path: final_path.to_path_buf(),
                        source: e,
                    });
                }
                debug!(path = %final_path.display(), "final directory vanished, retrying rename");
                retried = true;
            }
            Err(source) => {
                return Err(FinalizeError::Io {
                    path: final_path.to_path_buf(),
                    source,
                });
            }
        }
    }

    let actual = tokio::fs::metadata(final_path)
        .await
        .map_err(|source| FinalizeError::Io {
            path: final_path.to_path_buf(),
            source,
        })?
        .len();
    if actual != expected {
        let _ = tokio::fs::remove_file(final_path).await;
        return Err(FinalizeError::SizeMismatch {
            path: final_path.to_path_buf(),
            expected,
            actual,
        });
    }

    debug!(path = %final_path.display(), bytes = actual, "published");
    Ok(())
}
