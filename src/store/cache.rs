//! On-disk form of the hash store.
//!
//! The main cache file is a JSON object `source -> creator -> [fingerprint]`.
//! Inserts between compactions go to a sidecar journal with one JSON object
//! per line, so a crash loses at most the line being written.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::StoreError;

/// `source -> creator -> fingerprints`, ordered for stable output.
pub type CacheMap = BTreeMap<String, BTreeMap<String, BTreeSet<String>>>;

/// One journaled insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Source partition.
    pub source: String,
    /// Creator partition.
    pub creator: String,
    /// Inserted fingerprint.
    pub fingerprint: String,
}

/// Path of the journal belonging to `cache_path`.
#[must_use]
pub fn journal_path(cache_path: &Path) -> PathBuf {
    let mut name = cache_path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".journal");
    cache_path.with_file_name(name)
}

/// Reads the main cache file. Missing or corrupt files read as empty.
pub async fn read_cache(path: &Path) -> CacheMap {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no hash cache yet");
            return CacheMap::new();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable hash cache, starting empty");
            return CacheMap::new();
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(map) => map,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt hash cache, starting empty");
            CacheMap::new()
        }
    }
}

/// Reads journal entries, skipping lines that do not parse.
pub async fn read_journal(path: &Path) -> Vec<JournalEntry> {
    let Ok(raw) = tokio::fs::read_to_string(path).await else {
        return Vec::new();
    };
    let mut entries = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(line = index + 1, error = %e, "skipping torn journal line"),
        }
    }
    entries
}

/// Writes `map` to `path` through a temp file and rename.
///
/// # Errors
///
/// Returns [`StoreError`] when serialization, the write or the rename fails.
pub async fn write_cache_atomic(path: &Path, map: &CacheMap) -> Result<(), StoreError> {
    let body = serde_json::to_vec_pretty(map).map_err(|e| StoreError::serialize(path, e))?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut file = File::create(&tmp)
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;
    file.write_all(&body)
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;
    file.sync_all().await.map_err(|e| StoreError::io(&tmp, e))?;
    drop(file);

    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::io(path, e))
}

/// Append-only journal file.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: Mutex<File>,
}

impl Journal {
    /// Opens (creating if needed) the journal at `path` in append mode.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the file cannot be opened.
    pub async fn open(path: PathBuf) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Appends one entry and flushes it to the OS.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when serialization or the write fails.
    pub async fn append(&self, entry: &JournalEntry) -> Result<(), StoreError> {
        self.append_then(entry, || ()).await
    }

    /// Appends one entry, then runs `apply` before releasing the journal.
    ///
    /// A checkpoint cannot start between the write and `apply`, so its
    /// snapshot either precedes the entry or includes what `apply` did.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when serialization or the write fails; `apply`
    /// is not run then.
    pub async fn append_then<R>(
        &self,
        entry: &JournalEntry,
        apply: impl FnOnce() -> R,
    ) -> Result<R, StoreError> {
        let mut line = serde_json::to_vec(entry).map_err(|e| StoreError::serialize(&self.path, e))?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.flush().await.map_err(|e| StoreError::io(&self.path, e))?;
        Ok(apply())
    }

    /// Runs `checkpoint` while holding the journal, then empties it.
    ///
    /// Inserts are blocked for the duration, so nothing journaled after the
    /// checkpoint's snapshot can be lost by the truncation.
    ///
    /// # Errors
    ///
    /// Returns the checkpoint's error, or the truncation failure.
    pub async fn checkpoint<F, Fut>(&self, checkpoint: F) -> Result<(), StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), StoreError>>,
    {
        let file = self.file.lock().await;
        checkpoint().await?;
        file.set_len(0)
            .await
            .map_err(|e| StoreError::io(&self.path, e))
    }
}
