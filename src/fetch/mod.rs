//! Metadata fetcher: the producer side of the pipeline.
//!
//! Pages through one creator at a time, filters out fingerprints the store
//! already knows, and publishes the rest into the bounded queue.
//!
//! # Pagination
//!
//! Pages are requested at offsets `0, page_size, 2 * page_size, ...` and
//! pagination stops when
//!
//! - a page comes back empty,
//! - a page yields fewer than `min_new_per_page` new items (the creator is
//!   considered caught up),
//! - a page fails after the retry budget, or
//! - the pipeline halts.
//!
//! # Queue-full policy
//!
//! Before each page the producer waits for room (see [`wait_for_room`]).
//! If the queue still fills up while a page is being enqueued, the new items
//! left on that page are dropped and counted, not retried.

mod backpressure;
mod source;

pub use backpressure::{QueueThresholds, wait_for_room};
pub use source::{Creator, FileRef, HttpSourceApi, PostRecord, SourceApi, display_name};

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::download::{DownloadError, RetryPolicy, retry_with_policy};
use crate::pipeline::PipelineState;
use crate::queue::{BoundedQueue, Fingerprint, ItemDescriptor, QueueError, SourceId};
use crate::store::HashStore;

/// Pagination and backpressure settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchSettings {
    /// Records per page; the offset advances by this much.
    pub page_size: usize,
    /// Fewer new items than this on a page ends pagination.
    pub min_new_per_page: usize,
    /// Queue pause/resume fractions.
    pub thresholds: QueueThresholds,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            page_size: 50,
            min_new_per_page: 10,
            thresholds: QueueThresholds::default(),
        }
    }
}

/// Why pagination of a creator ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// An empty page was returned.
    Exhausted,
    /// A page yielded fewer new items than the minimum.
    CaughtUp,
    /// A page failed permanently or after the retry budget.
    FetchFailed,
    /// The pipeline halted.
    Halted,
}

/// Per-creator result of [`MetadataFetcher::fetch_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatorReport {
    /// Pages that returned records.
    pub pages: usize,
    /// New items accepted into the queue.
    pub enqueued: u64,
    /// Items already known.
    pub skipped: u64,
    /// New items dropped because the queue was full.
    pub dropped: u64,
    /// Why pagination ended.
    pub stop: StopReason,
}

impl CreatorReport {
    fn new() -> Self {
        Self {
            pages: 0,
            enqueued: 0,
            skipped: 0,
            dropped: 0,
            stop: StopReason::Exhausted,
        }
    }
}

/// Producer publishing new items of one creator at a time.
#[derive(Debug, Clone)]
pub struct MetadataFetcher {
    queue: Arc<BoundedQueue<ItemDescriptor>>,
    store: Arc<HashStore>,
    state: Arc<PipelineState>,
    retry_policy: RetryPolicy,
    settings: FetchSettings,
}

impl MetadataFetcher {
    /// Creates a fetcher publishing into `queue`.
    #[must_use]
    pub fn new(
        queue: Arc<BoundedQueue<ItemDescriptor>>,
        store: Arc<HashStore>,
        state: Arc<PipelineState>,
        retry_policy: RetryPolicy,
        settings: FetchSettings,
    ) -> Self {
        Self {
            queue,
            store,
            state,
            retry_policy,
            settings,
        }
    }

    /// Paginates `creator` and enqueues every new file.
    #[instrument(skip(self, api, creator), fields(source = api.name(), creator = %creator.name))]
    pub async fn fetch_all(&self, api: &dyn SourceApi, creator: &Creator) -> CreatorReport {
        let mut report = CreatorReport::new();
        let mut page = 0usize;

        report.stop = loop {
            if self.state.is_halted() {
                break StopReason::Halted;
            }
            if !wait_for_room(
                &self.queue,
                self.settings.thresholds,
                &self.state,
                &creator.name,
            )
            .await
            {
                break StopReason::Halted;
            }

            let offset = page * self.settings.page_size;
            let label = format!("{}/{}/{}?o={offset}", api.name(), creator.service, creator.id);
            let records = retry_with_policy(&self.retry_policy, &self.state, &label, move |_| {
                api.posts(creator, offset)
            })
            .await;
            let records = match records {
                Ok(records) => records,
                Err(DownloadError::Interrupted { .. }) => break StopReason::Halted,
                Err(e) => {
                    warn!(page, error = %e, "listing failed, moving to next creator");
                    break StopReason::FetchFailed;
                }
            };
            if records.is_empty() {
                break StopReason::Exhausted;
            }
            report.pages += 1;

            let new_items = self.enqueue_page(api, creator, &records, &mut report);
            debug!(page, records = records.len(), new_items, "page processed");
            if new_items < self.settings.min_new_per_page {
                break StopReason::CaughtUp;
            }
            page += 1;
        };

        if report.stop != StopReason::Halted {
            info!(
                pages = report.pages,
                enqueued = report.enqueued,
                skipped = report.skipped,
                dropped = report.dropped,
                stop = ?report.stop,
                "creator done"
            );
        }
        report
    }

    /// Enqueues the new files of one page and returns how many were new.
    ///
    /// A fingerprint repeated within the page is only considered once.
    fn enqueue_page(
        &self,
        api: &dyn SourceApi,
        creator: &Creator,
        records: &[PostRecord],
        report: &mut CreatorReport,
    ) -> usize {
        let mut new_items = 0;
        let mut full = false;
        let mut seen = HashSet::new();

        for path in records.iter().flat_map(|record| record.paths()) {
            let Some((fingerprint, extension)) = Fingerprint::from_source_path(path) else {
                debug!(path, "file path has no usable name");
                continue;
            };
            if !seen.insert(fingerprint.clone()) {
                continue;
            }
            if self.store.has(&creator.directory, &creator.name, &fingerprint) {
                self.state.record_skipped();
                report.skipped += 1;
                continue;
            }
            new_items += 1;
            if full {
                self.state.record_dropped(1);
                report.dropped += 1;
                continue;
            }

            let item = ItemDescriptor {
                source_id: SourceId {
                    source: creator.directory.clone(),
                    creator_id: creator.id.clone(),
                },
                display_name: creator.name.clone(),
                url: api.file_url(path),
                target_directory: PathBuf::from(&creator.directory).join(&creator.name),
                fingerprint,
                extension,
            };
            match self.queue.try_put(item) {
                Ok(()) => {
                    self.state.record_discovered();
                    report.enqueued += 1;
                }
                Err(rejected) => {
                    if let QueueError::Full { capacity } = rejected.error {
                        warn!(capacity, "download queue full, dropping rest of page");
                    } else {
                        debug!(error = %rejected.error, "queue refused item, dropping rest of page");
                    }
                    full = true;
                    self.state.record_dropped(1);
                    report.dropped += 1;
                }
            }
        }
        new_items
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::pipeline::HaltReason;

    /// Serves pages from memory; offsets without a page return empty.
    struct FakeApi {
        pages: HashMap<usize, Vec<PostRecord>>,
        requests: Mutex<Vec<usize>>,
        failures_left: AtomicUsize,
        failure_status: u16,
    }

    impl FakeApi {
        fn new(pages: Vec<Vec<PostRecord>>) -> Self {
            Self {
                pages: pages
                    .into_iter()
                    .enumerate()
                    .map(|(i, page)| (i * 50, page))
                    .collect(),
                requests: Mutex::new(Vec::new()),
                failures_left: AtomicUsize::new(0),
                failure_status: 503,
            }
        }

        fn failing(mut self, times: usize, status: u16) -> Self {
            self.failures_left = AtomicUsize::new(times);
            self.failure_status = status;
            self
        }

        fn requests(&self) -> Vec<usize> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SourceApi for FakeApi {
        fn name(&self) -> &str {
            "fake"
        }

        fn file_url(&self, path: &str) -> String {
            format!("https://files.example{path}")
        }

        async fn favorites(&self) -> Result<Vec<Creator>, DownloadError> {
            Ok(Vec::new())
        }

        async fn posts(&self, _creator: &Creator, offset: usize) -> Result<Vec<PostRecord>, DownloadError> {
            self.requests.lock().unwrap().push(offset);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(DownloadError::http_status("fake", self.failure_status));
            }
            Ok(self.pages.get(&offset).cloned().unwrap_or_default())
        }
    }

    fn hash(n: usize) -> String {
        format!("{n:0>40}")
    }

    fn page(range: std::ops::Range<usize>) -> Vec<PostRecord> {
        range
            .map(|n| PostRecord {
                file: Some(FileRef {
                    path: Some(format!("/data/{}.png", hash(n))),
                }),
                attachments: Vec::new(),
            })
            .collect()
    }

    fn creator() -> Creator {
        Creator {
            id: "1".to_string(),
            name: "Artist".to_string(),
            service: "patreon".to_string(),
            directory: "Patreon".to_string(),
        }
    }

    struct Fixture {
        fetcher: MetadataFetcher,
        queue: Arc<BoundedQueue<ItemDescriptor>>,
        store: Arc<HashStore>,
        state: Arc<PipelineState>,
    }

    fn fixture(capacity: usize) -> Fixture {
        let queue = Arc::new(BoundedQueue::new(capacity).unwrap());
        let store = Arc::new(HashStore::in_memory());
        let state = Arc::new(PipelineState::new());
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2), 2.0)
            .with_max_jitter(Duration::ZERO);
        let settings = FetchSettings {
            thresholds: QueueThresholds {
                low: 0.2,
                high: 1.0,
            },
            ..FetchSettings::default()
        };
        Fixture {
            fetcher: MetadataFetcher::new(
                Arc::clone(&queue),
                Arc::clone(&store),
                Arc::clone(&state),
                policy,
                settings,
            ),
            queue,
            store,
            state,
        }
    }

    async fn remember(store: &HashStore, range: std::ops::Range<usize>) {
        for n in range {
            let fp = Fingerprint::new(&hash(n)).unwrap();
            store.insert("Patreon", "Artist", &fp).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_stops_after_page_with_few_new_items() {
        let f = fixture(500);
        remember(&f.store, 100..145).await;
        let mut second = page(100..145);
        second.extend(page(200..205));
        let api = FakeApi::new(vec![page(0..50), second, page(300..350)]);

        let report = f.fetcher.fetch_all(&api, &creator()).await;

        assert_eq!(report.stop, StopReason::CaughtUp);
        assert_eq!(report.pages, 2);
        assert_eq!(report.enqueued, 55);
        assert_eq!(report.skipped, 45);
        assert_eq!(api.requests(), vec![0, 50]);
        assert_eq!(f.queue.len(), 55);
    }

    #[tokio::test]
    async fn test_repeated_file_on_page_enqueued_once() {
        let f = fixture(500);
        let path = format!("/data/{}.png", hash(7));
        let record = PostRecord {
            file: Some(FileRef {
                path: Some(path.clone()),
            }),
            attachments: vec![
                FileRef {
                    path: Some(path.clone()),
                },
                FileRef { path: Some(path) },
            ],
        };
        let mut first = page(0..1);
        first.push(record.clone());
        first.push(record);
        let api = FakeApi::new(vec![first]);

        let report = f.fetcher.fetch_all(&api, &creator()).await;

        assert_eq!(report.enqueued, 2);
        assert_eq!(report.skipped, 0);
        assert_eq!(f.queue.len(), 2);
        assert_eq!(f.state.summary().discovered, 2);
    }

    #[tokio::test]
    async fn test_traversal_path_is_not_enqueued() {
        let f = fixture(500);
        let mut first = page(0..1);
        first.push(PostRecord {
            file: Some(FileRef {
                path: Some("/data/..%2F..%2F..%2Fescape.png".to_string()),
            }),
            attachments: Vec::new(),
        });
        let api = FakeApi::new(vec![first]);

        let report = f.fetcher.fetch_all(&api, &creator()).await;

        assert_eq!(report.enqueued, 1);
        assert_eq!(f.queue.try_get().unwrap().fingerprint.as_str(), &hash(0)[..30]);
    }

    #[tokio::test]
    async fn test_stops_on_empty_page() {
        let f = fixture(500);
        let api = FakeApi::new(vec![page(0..50), page(50..100)]);
        let report = f.fetcher.fetch_all(&api, &creator()).await;
        assert_eq!(report.stop, StopReason::Exhausted);
        assert_eq!(api.requests(), vec![0, 50, 100]);
        assert_eq!(f.state.summary().discovered, 100);
    }

    #[tokio::test]
    async fn test_descriptor_fields() {
        let f = fixture(500);
        let api = FakeApi::new(vec![page(0..1)]);
        f.fetcher.fetch_all(&api, &creator()).await;
        let item = f.queue.try_get().unwrap();
        assert_eq!(item.url, format!("https://files.example/data/{}.png", hash(0)));
        assert_eq!(item.fingerprint.as_str(), &hash(0)[..30]);
        assert_eq!(item.extension, ".png");
        assert_eq!(item.target_directory, PathBuf::from("Patreon/Artist"));
        assert_eq!(item.source_id.source, "Patreon");
    }

    #[tokio::test]
    async fn test_full_queue_drops_rest_of_page() {
        let f = fixture(20);
        let api = Arc::new(FakeApi::new(vec![page(0..50), page(50..100)]));

        let task = {
            let fetcher = f.fetcher.clone();
            let api = Arc::clone(&api);
            tokio::spawn(async move { fetcher.fetch_all(api.as_ref(), &creator()).await })
        };
        // The second page waits for room that never comes; halting releases it.
        tokio::time::timeout(Duration::from_secs(1), async {
            while f.state.summary().dropped < 30 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(api.requests(), vec![0]);
        f.state.halt(HaltReason::Interrupted);

        let report = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.stop, StopReason::Halted);
        assert_eq!(report.enqueued, 20);
        assert_eq!(report.dropped, 30);
        assert_eq!(f.queue.len(), 20);
        assert_eq!(f.queue.high_water_mark(), 20);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let f = fixture(500);
        let api = FakeApi::new(vec![page(0..5)]).failing(2, 503);
        let report = f.fetcher.fetch_all(&api, &creator()).await;
        assert_eq!(report.enqueued, 5);
        assert_eq!(api.requests(), vec![0, 0, 0]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_end_creator() {
        let f = fixture(500);
        let api = FakeApi::new(vec![page(0..50)]).failing(10, 503);
        let report = f.fetcher.fetch_all(&api, &creator()).await;
        assert_eq!(report.stop, StopReason::FetchFailed);
        assert_eq!(api.requests().len(), 3);
        assert!(!f.state.is_halted());
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let f = fixture(500);
        let api = FakeApi::new(vec![page(0..50)]).failing(1, 404);
        let report = f.fetcher.fetch_all(&api, &creator()).await;
        assert_eq!(report.stop, StopReason::FetchFailed);
        assert_eq!(api.requests(), vec![0]);
    }

    #[tokio::test]
    async fn test_halted_fetcher_makes_no_requests() {
        let f = fixture(500);
        f.state.halt(HaltReason::Interrupted);
        let api = FakeApi::new(vec![page(0..50)]);
        let report = f.fetcher.fetch_all(&api, &creator()).await;
        assert_eq!(report.stop, StopReason::Halted);
        assert!(api.requests().is_empty());
    }
}
