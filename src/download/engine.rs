//! Resizable pool of download workers fed by the bounded queue.
//!
//! # Worker loop
//!
//! Each worker takes one [`ItemDescriptor`] at a time and runs:
//!
//! 1. admission: drop if halted, skip if another worker holds the same
//!    scratch path or the fingerprint is already known, halt the pipeline
//!    if the disk guard refuses;
//! 2. transfer: stream the body into the scratch tree under the retry policy,
//!    observing the halt signal between chunks;
//! 3. finalize: rename into final storage, then record the fingerprint.
//!
//! Per-item failures are counted and logged; the worker moves on. A panic
//! while processing one item is caught so the worker survives it.
//!
//! # Resizing
//!
//! The pool is driven through a [`PoolHandle`]: a target size sent on the
//! control channel makes the pool spawn workers or retire the newest ones.
//! A retired worker finishes its current item before exiting.
//!
//! ```no_run
//! # use harvester_core::download::{DownloadWorkerPool, WorkerContext};
//! # async fn example(ctx: WorkerContext) -> Result<(), Box<dyn std::error::Error>> {
//! let pool = DownloadWorkerPool::spawn(ctx, 4, 1, 16)?;
//! let handle = pool.handle();
//! handle.request_resize(8).await;
//! // ... close the queue once producers finish ...
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod finalize;

pub use finalize::{FinalizeError, StorageLayout, publish};

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashSet;
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::retry::{RetryPolicy, classify_error, retry_with_policy};
use super::{DownloadError, ErrorKind, HttpClient};
use crate::pipeline::{HaltReason, PipelineState, SizeWindow};
use crate::queue::{BoundedQueue, ItemDescriptor};
use crate::resource::ResourceGuard;
use crate::store::HashStore;
use crate::units::format_bytes;

/// Minimum allowed worker count.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed worker count.
const MAX_CONCURRENCY: usize = 100;

/// Default initial worker count.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Error type for pool construction.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Bounds outside the allowed range or not ordered `min <= initial <= max`.
    #[error(
        "invalid concurrency bounds min={min} initial={initial} max={max}: \
         need {MIN_CONCURRENCY} <= min <= initial <= max <= {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// Lower bound.
        min: usize,
        /// Starting size.
        initial: usize,
        /// Upper bound.
        max: usize,
    },
}

/// Everything a worker needs, shared by all workers of a pool.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    /// Source of items.
    pub queue: Arc<BoundedQueue<ItemDescriptor>>,
    /// Known fingerprints.
    pub store: Arc<HashStore>,
    /// Disk-space admission check.
    pub guard: Arc<ResourceGuard>,
    /// Halt signal and counters.
    pub state: Arc<PipelineState>,
    /// Shared HTTP client.
    pub client: HttpClient,
    /// Retry policy for transfers.
    pub retry_policy: RetryPolicy,
    /// Scratch and final roots.
    pub layout: StorageLayout,
    /// Completed-file sizes, read by the concurrency controller.
    pub sizes: Arc<SizeWindow>,
    /// Scratch paths currently being transferred.
    pub in_flight: Arc<InFlight>,
}

/// Scratch paths claimed by running transfers.
///
/// Two items with the same fingerprint under the same creator map to the
/// same scratch file; only the first claim proceeds.
#[derive(Debug, Default)]
pub struct InFlight {
    paths: DashSet<PathBuf>,
}

impl InFlight {
    /// Claims `path`, or returns `None` when another transfer holds it.
    #[must_use]
    pub fn claim(&self, path: &Path) -> Option<Claim<'_>> {
        let path = path.to_path_buf();
        if !self.paths.insert(path.clone()) {
            return None;
        }
        Some(Claim { owner: self, path })
    }

    /// Number of held claims.
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Returns true when nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Released on drop.
#[derive(Debug)]
pub struct Claim<'a> {
    owner: &'a InFlight,
    path: PathBuf,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.owner.paths.remove(&self.path);
    }
}

/// How one item ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Published to final storage.
    Downloaded {
        /// File size.
        bytes: u64,
    },
    /// Already known.
    Skipped,
    /// Not attempted because the pipeline halted.
    Dropped,
    /// Abandoned after an error.
    Failed,
}

/// Cloneable remote control of a running pool.
#[derive(Debug, Clone)]
pub struct PoolHandle {
    control: mpsc::Sender<usize>,
    size: watch::Receiver<usize>,
}

impl PoolHandle {
    /// Current number of active workers.
    #[must_use]
    pub fn size(&self) -> usize {
        *self.size.borrow()
    }

    /// Asks the pool to converge on `target` workers, clamped to its bounds.
    ///
    /// Returns false when the pool has shut down.
    pub async fn request_resize(&self, target: usize) -> bool {
        self.control.send(target).await.is_ok()
    }

    /// Waits until the pool reports exactly `size` workers.
    pub async fn wait_for_size(&mut self, size: usize) {
        let _ = self.size.wait_for(|current| *current == size).await.map(|_| ());
    }
}

/// Running pool of download workers.
#[derive(Debug)]
pub struct DownloadWorkerPool {
    handle: PoolHandle,
    shutdown: oneshot::Sender<()>,
    manager: JoinHandle<()>,
}

impl DownloadWorkerPool {
    /// Spawns `initial` workers with room to resize within `[min, max]`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConcurrency`] unless
    /// `1 <= min <= initial <= max <= 100`.
    #[instrument(level = "debug", skip(ctx))]
    pub fn spawn(
        ctx: WorkerContext,
        initial: usize,
        min: usize,
        max: usize,
    ) -> Result<Self, EngineError> {
        let valid = MIN_CONCURRENCY <= min && min <= initial && initial <= max && max <= MAX_CONCURRENCY;
        if !valid {
            return Err(EngineError::InvalidConcurrency { min, initial, max });
        }

        let (control_tx, control_rx) = mpsc::channel(8);
        let (size_tx, size_rx) = watch::channel(0);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let mut manager = Manager {
            ctx: Arc::new(ctx),
            min,
            max,
            active: Vec::new(),
            retired: Vec::new(),
            next_id: 0,
            size: size_tx,
        };
        manager.resize(initial);
        info!(workers = initial, min, max, "download pool started");

        let manager = tokio::spawn(manager.run(control_rx, shutdown_rx));
        Ok(Self {
            handle: PoolHandle {
                control: control_tx,
                size: size_rx,
            },
            shutdown: shutdown_tx,
            manager,
        })
    }

    /// Returns a control handle for the concurrency controller.
    #[must_use]
    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    /// Current number of active workers.
    #[must_use]
    pub fn size(&self) -> usize {
        self.handle.size()
    }

    /// Waits for every worker to exit.
    ///
    /// Workers exit once the queue is closed and empty, so close the queue
    /// first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.manager.await {
            warn!(error = %e, "pool manager panicked");
        }
    }
}

struct Worker {
    retire: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct Manager {
    ctx: Arc<WorkerContext>,
    min: usize,
    max: usize,
    active: Vec<Worker>,
    retired: Vec<JoinHandle<()>>,
    next_id: usize,
    size: watch::Sender<usize>,
}

impl Manager {
    async fn run(mut self, mut control: mpsc::Receiver<usize>, mut shutdown: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                target = control.recv() => match target {
                    Some(target) => self.resize(target),
                    None => {
                        let _ = (&mut shutdown).await;
                        break;
                    }
                },
                _ = &mut shutdown => break,
            }
        }

        // Retire senders stay alive until every worker has drained the queue.
        let (_retire, handles): (Vec<_>, Vec<_>) = self
            .active
            .drain(..)
            .map(|worker| (worker.retire, worker.handle))
            .unzip();
        for handle in handles.into_iter().chain(self.retired.drain(..)) {
            if let Err(e) = handle.await {
                warn!(error = %e, "download worker panicked");
            }
        }
        self.size.send_replace(0);
        debug!("download pool stopped");
    }

    fn resize(&mut self, target: usize) {
        let target = target.clamp(self.min, self.max);
        self.retired.retain(|handle| !handle.is_finished());

        while self.active.len() < target {
            let (retire_tx, retire_rx) = oneshot::channel();
            let id = self.next_id;
            self.next_id += 1;
            let handle = tokio::spawn(worker_loop(id, Arc::clone(&self.ctx), retire_rx));
            self.active.push(Worker {
                retire: retire_tx,
                handle,
            });
        }
        while self.active.len() > target {
            if let Some(worker) = self.active.pop() {
                let _ = worker.retire.send(());
                self.retired.push(worker.handle);
            }
        }

        let previous = self.size.send_replace(target);
        if previous != target {
            debug!(previous, target, "pool resized");
        }
    }
}

async fn worker_loop(id: usize, ctx: Arc<WorkerContext>, mut retire: oneshot::Receiver<()>) {
    debug!(worker = id, "worker started");
    loop {
        let item = tokio::select! {
            biased;
            _ = &mut retire => {
                debug!(worker = id, "worker retired");
                return;
            }
            item = ctx.queue.get() => item,
        };
        let Some(item) = item else {
            debug!(worker = id, "queue closed, worker exiting");
            return;
        };

        let fingerprint = item.fingerprint.clone();
        let result = AssertUnwindSafe(process(&ctx, item)).catch_unwind().await;
        if result.is_err() {
            error!(worker = id, %fingerprint, "item processing panicked");
            ctx.state.record_failed();
        }
        ctx.queue.task_done();
    }
}

/// Runs admission, transfer and finalize for one item and updates counters.
#[instrument(
    level = "debug",
    skip(ctx, item),
    fields(fingerprint = %item.fingerprint, creator = %item.display_name)
)]
pub async fn process(ctx: &WorkerContext, item: ItemDescriptor) -> Outcome {
    let state = &*ctx.state;

    if state.is_halted() {
        debug!("halted, dropping item");
        return Outcome::Dropped;
    }

    let scratch = ctx.layout.scratch_path(&item);
    let Some(_claim) = ctx.in_flight.claim(&scratch) else {
        debug!("same file already in flight");
        state.record_skipped();
        return Outcome::Skipped;
    };
    if ctx
        .store
        .has(&item.source_id.source, &item.display_name, &item.fingerprint)
    {
        debug!("already stored");
        state.record_skipped();
        return Outcome::Skipped;
    }
    if !ctx.guard.check_free_space() {
        state.halt(HaltReason::LowDiskSpace);
        return Outcome::Dropped;
    }

    let started = Instant::now();
    let final_path = ctx.layout.final_path(&item);

    let client = &ctx.client;
    let url = item.url.as_str();
    let scratch_ref = scratch.as_path();
    let transfer = retry_with_policy(&ctx.retry_policy, state, url, move |_| {
        client.stream_to_path(url, scratch_ref, state)
    })
    .await;

    let transfer = match transfer {
        Ok(transfer) => transfer,
        Err(e) => return transfer_failed(state, &item, &e),
    };

    if let Err(e) = publish(&scratch, &final_path, transfer.bytes).await {
        error!(url, error = %e, "could not finalize download");
        let _ = tokio::fs::remove_file(&scratch).await;
        state.record_failed();
        return Outcome::Failed;
    }

    match ctx
        .store
        .insert(&item.source_id.source, &item.display_name, &item.fingerprint)
        .await
    {
        Ok(_) => {}
        Err(e) => {
            error!(error = %e, "could not record fingerprint");
            state.record_failed();
            state.halt(HaltReason::Fatal);
            return Outcome::Failed;
        }
    }

    state.record_downloaded(transfer.bytes);
    ctx.sizes.record(transfer.bytes);
    info!(
        "[{}/{}] {:.1}% used | {} | {} in {:.2}s",
        ctx.queue.len(),
        ctx.queue.capacity(),
        ctx.guard.usage_percentage(),
        item.fingerprint,
        format_bytes(transfer.bytes),
        started.elapsed().as_secs_f64()
    );
    Outcome::Downloaded {
        bytes: transfer.bytes,
    }
}

fn transfer_failed(state: &PipelineState, item: &ItemDescriptor, e: &DownloadError) -> Outcome {
    let kind = classify_error(e);
    match kind {
        ErrorKind::Interrupted => {
            debug!(url = %item.url, "transfer interrupted by halt");
            return Outcome::Dropped;
        }
        kind if kind.is_expected_transport() => {
            warn!(url = %item.url, ?kind, error = %e, "download failed");
        }
        kind => {
            error!(url = %item.url, ?kind, error = ?e, "download failed");
        }
    }
    state.record_failed();
    Outcome::Failed
}
