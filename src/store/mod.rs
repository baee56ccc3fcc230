//! Persistent set of fingerprints already present in final storage.
//!
//! Fingerprints are partitioned by source directory label and creator name,
//! mirroring the final storage layout. Every insert is journaled before it
//! becomes visible to queries, and the journal is folded into the main cache
//! file on open and on [`HashStore::compact`].
//!
//! # Example
//!
//! ```
//! use harvester_core::queue::Fingerprint;
//! use harvester_core::store::HashStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = HashStore::in_memory();
//! let fp = Fingerprint::new("0123456789abcdef").ok_or("blank")?;
//! store.insert("Patreon", "Artist", &fp).await?;
//! assert!(store.has("Patreon", "Artist", &fp));
//! # Ok(())
//! # }
//! ```

mod cache;
mod reconcile;

pub use cache::{CacheMap, JournalEntry, journal_path};
pub use reconcile::{LocalLister, RcloneLister, StorageLister};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::queue::Fingerprint;
use cache::Journal;

/// Errors raised by the hash store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing a cache file failed.
    #[error("hash store IO error at {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Encoding the cache failed.
    #[error("could not serialize hash store to {path}: {source}")]
    Serialize {
        /// Destination file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// Listing final storage failed.
    #[error("could not list {target}: {message}")]
    Listing {
        /// Directory or remote path being listed.
        target: String,
        /// Lister message.
        message: String,
    },
}

impl StoreError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a serialization error.
    pub fn serialize(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Serialize {
            path: path.into(),
            source,
        }
    }

    /// Creates a listing error.
    pub fn listing(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Listing {
            target: target.into(),
            message: message.into(),
        }
    }
}

type Partition = HashMap<String, HashSet<String>>;

/// Concurrent fingerprint set with incremental persistence.
#[derive(Debug)]
pub struct HashStore {
    partitions: DashMap<String, Partition>,
    persistence: Option<Persistence>,
}

#[derive(Debug)]
struct Persistence {
    cache_path: PathBuf,
    journal: Journal,
}

impl HashStore {
    /// Creates an empty store that is never written to disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            partitions: DashMap::new(),
            persistence: None,
        }
    }

    /// Loads the cache at `cache_path` plus its journal, then compacts.
    ///
    /// A missing or corrupt cache loads as empty.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the compacted cache or journal cannot be
    /// written.
    #[instrument(fields(path = %cache_path.display()))]
    pub async fn open(cache_path: &Path) -> Result<Self, StoreError> {
        let journal_file = journal_path(cache_path);
        let map = cache::read_cache(cache_path).await;
        let replayed = cache::read_journal(&journal_file).await;

        let store = Self {
            partitions: DashMap::new(),
            persistence: Some(Persistence {
                cache_path: cache_path.to_path_buf(),
                journal: Journal::open(journal_file).await?,
            }),
        };
        for (source, creators) in map {
            for (creator, fingerprints) in creators {
                for raw in fingerprints {
                    store.insert_memory(&source, &creator, &raw);
                }
            }
        }
        let replayed_count = replayed.len();
        for entry in replayed {
            store.insert_memory(&entry.source, &entry.creator, &entry.fingerprint);
        }

        store.compact().await?;
        info!(
            fingerprints = store.len(),
            replayed = replayed_count,
            "hash store loaded"
        );
        Ok(store)
    }

    /// Returns true when `fingerprint`, or a cached prefix of it, is known.
    #[must_use]
    pub fn has(&self, source: &str, creator: &str, fingerprint: &Fingerprint) -> bool {
        let Some(partition) = self.partitions.get(source) else {
            return false;
        };
        let Some(known) = partition.get(creator) else {
            return false;
        };
        fingerprint.prefixes().any(|prefix| known.contains(prefix))
    }

    /// Records a fingerprint whose file is fully present in final storage.
    ///
    /// The insert is journaled before it becomes visible, and compaction
    /// cannot run in between. Returns false when the fingerprint was already
    /// known.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the journal write fails; the fingerprint is
    /// then not recorded.
    pub async fn insert(
        &self,
        source: &str,
        creator: &str,
        fingerprint: &Fingerprint,
    ) -> Result<bool, StoreError> {
        if self.has(source, creator, fingerprint) {
            return Ok(false);
        }
        let Some(persistence) = &self.persistence else {
            return Ok(self.insert_memory(source, creator, fingerprint.as_str()));
        };
        let entry = JournalEntry {
            source: source.to_string(),
            creator: creator.to_string(),
            fingerprint: fingerprint.as_str().to_string(),
        };
        persistence
            .journal
            .append_then(&entry, || {
                self.insert_memory(source, creator, fingerprint.as_str())
            })
            .await
    }

    /// Replaces every creator partition under `source` with what `lister`
    /// finds in final storage under `dir`.
    ///
    /// Files whose stem is shorter than a full fingerprint are ignored.
    /// Returns the number of fingerprints found.
    ///
    /// # Errors
    ///
    /// Returns the lister's error; the store is left unchanged in that case.
    #[instrument(skip(self, lister))]
    pub async fn reconcile(
        &self,
        source: &str,
        dir: &str,
        lister: &dyn StorageLister,
    ) -> Result<usize, StoreError> {
        let mut rebuilt = Partition::new();
        for creator in lister.list_dirs(dir).await? {
            let files = lister.list_files(&format!("{dir}/{creator}")).await?;
            let known: HashSet<String> = files
                .iter()
                .filter_map(|name| Fingerprint::from_stored_file_name(name))
                .map(|fp| fp.as_str().to_string())
                .collect();
            debug!(creator, count = known.len(), "reconciled creator");
            rebuilt.insert(creator, known);
        }
        let found = rebuilt.values().map(HashSet::len).sum();
        self.partitions.insert(source.to_string(), rebuilt);
        info!(source, found, "reconciled against storage listing");
        Ok(found)
    }

    /// Folds the journal into the main cache file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the cache cannot be written.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        persistence
            .journal
            .checkpoint(move || async move {
                let snapshot = self.snapshot();
                cache::write_cache_atomic(&persistence.cache_path, &snapshot).await
            })
            .await
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> CacheMap {
        let mut map = CacheMap::new();
        for partition in self.partitions.iter() {
            let creators = map.entry(partition.key().clone()).or_default();
            for (creator, known) in partition.value() {
                creators
                    .entry(creator.clone())
                    .or_default()
                    .extend(known.iter().cloned());
            }
        }
        map
    }

    /// Total number of fingerprints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.partitions
            .iter()
            .map(|partition| partition.values().map(HashSet::len).sum::<usize>())
            .sum()
    }

    /// Returns true when no fingerprint is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert_memory(&self, source: &str, creator: &str, raw: &str) -> bool {
        let Some(fingerprint) = Fingerprint::new(raw) else {
            return false;
        };
        self.partitions
            .entry(source.to_string())
            .or_default()
            .entry(creator.to_string())
            .or_default()
            .insert(fingerprint.as_str().to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;

    const HASH: &str = "0123456789abcdef0123456789abcdef0123456789abcdef";

    fn fp(raw: &str) -> Fingerprint {
        Fingerprint::new(raw).unwrap()
    }

    // ==================== Membership Tests ====================

    #[tokio::test]
    async fn test_insert_then_has() {
        let store = HashStore::in_memory();
        assert!(!store.has("Patreon", "A", &fp(HASH)));
        assert!(store.insert("Patreon", "A", &fp(HASH)).await.unwrap());
        assert!(store.has("Patreon", "A", &fp(HASH)));
        assert!(!store.has("Patreon", "B", &fp(HASH)));
        assert!(!store.has("Fanbox", "A", &fp(HASH)));
    }

    #[tokio::test]
    async fn test_second_insert_reports_known() {
        let store = HashStore::in_memory();
        store.insert("Patreon", "A", &fp(HASH)).await.unwrap();
        assert!(!store.insert("Patreon", "A", &fp(HASH)).await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_cached_prefix_matches_longer_fingerprint() {
        let store = HashStore::in_memory();
        store.insert_memory("Patreon", "A", &HASH[..12]);
        assert!(store.has("Patreon", "A", &fp(HASH)));
        assert!(!store.has("Patreon", "A", &fp("ffff0000")));
    }

    #[test]
    fn test_untruncated_cache_entries_are_normalized() {
        let store = HashStore::in_memory();
        store.insert_memory("Patreon", "A", HASH);
        assert!(store.has("Patreon", "A", &fp(HASH)));
    }

    // ==================== Persistence Tests ====================

    #[tokio::test]
    async fn test_open_missing_cache_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = HashStore::open(&temp.path().join("hashes.json"))
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_open_corrupt_cache_is_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("hashes.json");
        std::fs::write(&path, b"[[[").unwrap();
        let store = HashStore::open(&path).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_insert_survives_crash_via_journal() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("hashes.json");
        {
            let store = HashStore::open(&path).await.unwrap();
            store.insert("Patreon", "A", &fp(HASH)).await.unwrap();
            // dropped without compaction
        }
        let journal = std::fs::read_to_string(journal_path(&path)).unwrap();
        assert_eq!(journal.lines().count(), 1);

        let reopened = HashStore::open(&path).await.unwrap();
        assert!(reopened.has("Patreon", "A", &fp(HASH)));

        let compacted = std::fs::read_to_string(&path).unwrap();
        assert!(compacted.contains(&HASH[..30]));
        assert!(std::fs::read_to_string(journal_path(&path)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reads_historical_cache_layout() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cached_hashes.json");
        std::fs::write(
            &path,
            format!(r#"{{"Patreon": {{"Artist": ["{}"]}}}}"#, &HASH[..20]),
        )
        .unwrap();
        let store = HashStore::open(&path).await.unwrap();
        assert!(store.has("Patreon", "Artist", &fp(HASH)));
    }

    #[tokio::test]
    async fn test_concurrent_inserts_all_recorded() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("hashes.json");
        let store = Arc::new(HashStore::open(&path).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .insert("Patreon", "A", &fp(&format!("hash{i:04}")))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        store.compact().await.unwrap();

        let reopened = HashStore::open(&path).await.unwrap();
        assert_eq!(reopened.len(), 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_inserts_racing_compaction_are_persisted() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("hashes.json");
        let store = Arc::new(HashStore::open(&path).await.unwrap());

        let compactor = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for _ in 0..50 {
                    store.compact().await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let mut handles = Vec::new();
        for task in 0..4 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    store
                        .insert("Patreon", "A", &fp(&format!("race{task}x{i:04}")))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        compactor.await.unwrap();
        drop(store);

        let reopened = HashStore::open(&path).await.unwrap();
        assert_eq!(reopened.len(), 200);
    }

    // ==================== Reconcile Tests ====================

    #[tokio::test]
    async fn test_reconcile_replaces_source_partition() {
        let temp = TempDir::new().unwrap();
        let artist = temp.path().join("Patreon/Artist");
        std::fs::create_dir_all(&artist).unwrap();
        std::fs::write(artist.join(format!("{}.png", &HASH[..30])), b"x").unwrap();
        std::fs::write(artist.join("cover.png"), b"x").unwrap();

        let store = HashStore::in_memory();
        store.insert("Patreon", "Gone", &fp("stale")).await.unwrap();
        store.insert("Fanbox", "Other", &fp("keep")).await.unwrap();

        let found = store
            .reconcile("Patreon", "Patreon", &LocalLister::new(temp.path()))
            .await
            .unwrap();

        assert_eq!(found, 1);
        assert!(store.has("Patreon", "Artist", &fp(HASH)));
        assert!(!store.has("Patreon", "Gone", &fp("stale")));
        assert!(store.has("Fanbox", "Other", &fp("keep")));
    }
}
