//! Listing final storage to rebuild known fingerprints.
//!
//! Final storage is laid out as `<source dir>/<creator>/<fingerprint><ext>`.
//! A [`StorageLister`] answers the two questions reconcile needs: which
//! creator directories exist under a source directory, and which files sit in
//! one creator directory.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::StoreError;

/// Read access to a storage tree, local or remote.
#[async_trait]
pub trait StorageLister: Send + Sync {
    /// Names of the directories directly under `dir`.
    async fn list_dirs(&self, dir: &str) -> Result<Vec<String>, StoreError>;

    /// Names of the files directly under `dir`.
    async fn list_files(&self, dir: &str) -> Result<Vec<String>, StoreError>;
}

/// Lists a local directory tree. Missing directories list as empty.
#[derive(Debug, Clone)]
pub struct LocalLister {
    root: PathBuf,
}

impl LocalLister {
    /// Lists under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn entries(&self, dir: &str, want_dirs: bool) -> Result<Vec<String>, StoreError> {
        let path = self.root.join(dir);
        let mut read_dir = match tokio::fs::read_dir(&path).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let mut names = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&path, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StoreError::io(entry.path(), e))?;
            if file_type.is_dir() == want_dirs
                && let Some(name) = entry.file_name().to_str()
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl StorageLister for LocalLister {
    async fn list_dirs(&self, dir: &str) -> Result<Vec<String>, StoreError> {
        self.entries(dir, true).await
    }

    async fn list_files(&self, dir: &str) -> Result<Vec<String>, StoreError> {
        self.entries(dir, false).await
    }
}

/// Lists a remote through `rclone lsf`.
#[derive(Debug, Clone)]
pub struct RcloneLister {
    binary: PathBuf,
    remote: String,
}

impl RcloneLister {
    /// Lists `remote:` (for example `gdrive:`) using the `rclone` binary.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            remote: remote.into(),
        }
    }

    fn target(&self, dir: &str) -> String {
        let remote = self.remote.trim_end_matches(':');
        format!("{remote}:{dir}")
    }

    async fn lsf(&self, dir: &str, kind_flag: &str) -> Result<Vec<String>, StoreError> {
        let target = self.target(dir);
        debug!(%target, kind_flag, "listing remote");
        let output = Command::new(&self.binary)
            .arg("lsf")
            .arg(&target)
            .arg(kind_flag)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| StoreError::listing(&target, e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("directory not found") {
                return Ok(Vec::new());
            }
            return Err(StoreError::listing(&target, stderr.trim().to_string()));
        }
        Ok(parse_lsf(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[async_trait]
impl StorageLister for RcloneLister {
    async fn list_dirs(&self, dir: &str) -> Result<Vec<String>, StoreError> {
        self.lsf(dir, "--dirs-only").await
    }

    async fn list_files(&self, dir: &str) -> Result<Vec<String>, StoreError> {
        self.lsf(dir, "--files-only").await
    }
}

/// Parses `rclone lsf` output: one name per line, directories end in `/`.
fn parse_lsf(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(|line| line.trim_end_matches('/'))
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
