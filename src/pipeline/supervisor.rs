//! Run lifecycle: startup, producers, drain and orderly shutdown.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream;
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::controller::{ConcurrencyController, SizeWindow};
use super::state::{PipelineState, PipelineSummary};
use super::sync::{RemoteSync, recommended_transfers, scan_tree};
use crate::config::{ConfigError, PipelineConfig};
use crate::download::{
    DownloadWorkerPool, EngineError, HttpClient, InFlight, RateLimiter, StorageLayout,
    WorkerContext,
};
use crate::fetch::{Creator, HttpSourceApi, MetadataFetcher, SourceApi};
use crate::queue::{BoundedQueue, ItemDescriptor, QueueError};
use crate::resource::{DiskProbe, ResourceGuard, SystemProbe};
use crate::store::{HashStore, LocalLister, RcloneLister, StorageLister, StoreError};
use crate::units::format_bytes;

/// Errors that prevent a run from starting.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The hash store could not be loaded or written.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A storage directory could not be prepared or probed.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The HTTP client could not be built.
    #[error("could not build HTTP client: {0}")]
    Http(#[source] reqwest::Error),

    /// Invalid worker bounds.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Invalid queue capacity.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl PipelineError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Owns one pipeline run.
///
/// ```no_run
/// use harvester_core::config::PipelineConfig;
/// use harvester_core::pipeline::PipelineSupervisor;
///
/// # async fn example(config: PipelineConfig) -> Result<(), Box<dyn std::error::Error>> {
/// let supervisor = PipelineSupervisor::new(config)?;
/// let state = supervisor.state();
/// // hand `state` to a signal handler, then:
/// let summary = supervisor.run().await?;
/// println!("downloaded {}", summary.downloaded);
/// # Ok(())
/// # }
/// ```
pub struct PipelineSupervisor {
    config: PipelineConfig,
    state: Arc<PipelineState>,
    probe: Arc<dyn DiskProbe>,
}

impl std::fmt::Debug for PipelineSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineSupervisor")
            .field("state", &self.state.run_state())
            .finish_non_exhaustive()
    }
}

struct Background {
    monitor: JoinHandle<()>,
    controller: JoinHandle<()>,
    sync: Option<JoinHandle<()>>,
}

impl PipelineSupervisor {
    /// Validates `config` and prepares a run using the system disk probe.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] when the config is invalid.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config,
            state: Arc::new(PipelineState::new()),
            probe: Arc::new(SystemProbe),
        })
    }

    /// Replaces the disk probe.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn DiskProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Shared state; halting it stops the run.
    #[must_use]
    pub fn state(&self) -> Arc<PipelineState> {
        Arc::clone(&self.state)
    }

    /// Runs the pipeline to completion or halt.
    ///
    /// Counts are logged and returned for every run that started, including
    /// halted ones.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] when startup fails.
    #[instrument(skip(self))]
    pub async fn run(self) -> Result<PipelineSummary, PipelineError> {
        let config = &self.config;
        let state = Arc::clone(&self.state);

        for dir in [&config.final_root, &config.scratch_root] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| PipelineError::io(dir, e))?;
        }
        if let Some(parent) = config.hash_cache.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::io(parent, e))?;
        }

        let client = HttpClient::with_timeouts(
            Duration::from_secs(config.connect_timeout_secs),
            Duration::from_secs(config.request_timeout_secs),
        )
        .map_err(PipelineError::Http)?
        .with_chunk_size(config.chunk_size);

        let guard = Arc::new(
            ResourceGuard::new(
                Arc::clone(&self.probe),
                &config.final_root,
                config.disk_floor(),
            )
            .map_err(|e| PipelineError::io(&config.final_root, e))?,
        );
        let store = Arc::new(HashStore::open(&config.hash_cache).await?);
        let remote = config.sync.enabled.then(|| {
            RemoteSync::new(
                &config.sync.binary,
                &config.sync.remote,
                &config.final_root,
                config.sync.threshold_bytes,
                Duration::from_secs(config.sync.poll_interval_secs.max(1)),
            )
        });
        if let Some(remote) = &remote {
            match remote.ensure_directories(&self.directories()).await {
                Ok(created) => debug!(created, "remote directories ready"),
                Err(e) => warn!(error = %e, "could not prepare remote directories"),
            }
        }
        if config.reconcile {
            self.reconcile(&store).await;
        }

        let queue = Arc::new(BoundedQueue::new(config.queue_capacity)?);
        let sizes = Arc::new(SizeWindow::new(config.controller_window));
        let ctx = WorkerContext {
            queue: Arc::clone(&queue),
            store: Arc::clone(&store),
            guard: Arc::clone(&guard),
            state: Arc::clone(&state),
            client: client.clone(),
            retry_policy: config.retry_policy(),
            layout: StorageLayout::new(&config.final_root, &config.scratch_root),
            sizes: Arc::clone(&sizes),
            in_flight: Arc::new(InFlight::default()),
        };
        let pool = DownloadWorkerPool::spawn(
            ctx,
            config.clamped_initial_workers(),
            config.min_workers,
            config.max_workers,
        )?;
        let background = Background {
            monitor: Arc::clone(&guard).spawn_monitor(
                Arc::clone(&state),
                Duration::from_millis(config.guard_interval_ms.max(1)),
            ),
            controller: ConcurrencyController::new(config.controller_settings(), sizes)
                .spawn(pool.handle(), Arc::clone(&state)),
            sync: remote.map(|remote| remote.spawn(Arc::clone(&state))),
        };

        let fetcher = MetadataFetcher::new(
            Arc::clone(&queue),
            Arc::clone(&store),
            Arc::clone(&state),
            config.retry_policy(),
            config.fetch_settings(),
        );
        let work = self.discover(&client).await;
        info!(creators = work.len(), "fetching posts");
        stream::iter(work)
            .for_each_concurrent(config.producer_concurrency, |(api, creator)| {
                let fetcher = &fetcher;
                let state = &state;
                async move {
                    if !state.is_halted() {
                        fetcher.fetch_all(api.as_ref(), &creator).await;
                    }
                }
            })
            .await;

        self.drain(&queue).await;
        pool.shutdown().await;
        background.monitor.abort();
        background.controller.abort();
        if let Some(sync) = background.sync {
            sync.abort();
        }

        if let Err(e) = store.compact().await {
            error!(error = %e, "could not compact hash store");
        }
        remove_scratch(&config.scratch_root).await;
        self.report_transfers().await;

        state.log_summary();
        Ok(state.summary())
    }

    /// Waits for the backlog, or discards it on halt.
    async fn drain(&self, queue: &BoundedQueue<ItemDescriptor>) {
        if self.state.begin_draining() {
            info!(backlog = queue.len(), "producers finished, draining queue");
        }
        tokio::select! {
            () = queue.join() => debug!("queue drained"),
            () = self.state.halted() => {
                let discarded = queue.clear();
                if discarded > 0 {
                    info!(discarded, "halted, discarding queued items");
                }
            }
        }
        queue.close();
    }

    /// Storage labels of every configured service.
    fn directories(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.config
            .sources
            .iter()
            .flat_map(|source| source.services.iter())
            .map(|service| service.directory.clone())
            .filter(|dir| seen.insert(dir.clone()))
            .collect()
    }

    /// Rebuilds each service partition from storage; failures keep the cache.
    async fn reconcile(&self, store: &HashStore) {
        let lister: Box<dyn StorageLister> = if self.config.sync.enabled {
            Box::new(RcloneLister::new(
                &self.config.sync.binary,
                &self.config.sync.remote,
            ))
        } else {
            Box::new(LocalLister::new(&self.config.final_root))
        };
        for dir in self.directories() {
            if let Err(e) = store.reconcile(&dir, &dir, lister.as_ref()).await {
                warn!(directory = %dir, error = %e, "reconcile failed, keeping cached fingerprints");
            }
        }
    }

    /// Favorites plus configured creators of every source, shuffled.
    async fn discover(&self, client: &HttpClient) -> Vec<(Arc<dyn SourceApi>, Creator)> {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(
            self.config.api_spacing_ms,
        )));
        let mut work: Vec<(Arc<dyn SourceApi>, Creator)> = Vec::new();
        let mut seen = HashSet::new();

        for source in &self.config.sources {
            let api = HttpSourceApi::new(
                client.clone(),
                source.clone(),
                source.session(),
                Arc::clone(&limiter),
            );
            let mut creators = api.configured_creators();
            if source.favorites {
                match api.favorites().await {
                    Ok(favorites) => creators.extend(favorites),
                    Err(e) => warn!(source = %source.name, error = %e, "could not fetch favorites"),
                }
            }
            let api: Arc<dyn SourceApi> = Arc::new(api);
            for creator in creators {
                let key = (source.name.clone(), creator.service.clone(), creator.id.clone());
                if seen.insert(key) {
                    work.push((Arc::clone(&api), creator));
                }
            }
        }

        work.shuffle(&mut rand::thread_rng());
        work
    }

    async fn report_transfers(&self) {
        match scan_tree(&self.config.final_root).await {
            Ok(stats) => {
                let transfers = recommended_transfers(stats.files);
                info!(
                    files = stats.files,
                    size = %format_bytes(stats.bytes),
                    transfers,
                    "recommended remote transfers"
                );
                let path = self.config.hash_cache.with_file_name("transfers.txt");
                if let Err(e) = tokio::fs::write(&path, transfers.to_string()).await {
                    debug!(path = %path.display(), error = %e, "could not write transfers file");
                }
            }
            Err(e) => warn!(error = %e, "could not scan final storage"),
        }
    }
}

async fn remove_scratch(scratch_root: &Path) {
    match tokio::fs::remove_dir_all(scratch_root).await {
        Ok(()) => debug!(path = %scratch_root.display(), "scratch tree removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %scratch_root.display(), error = %e, "could not remove scratch tree"),
    }
}
