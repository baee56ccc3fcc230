//! Adaptive worker count driven by recent file sizes.
//!
//! Small files are dominated by per-request latency and benefit from many
//! workers; large files saturate bandwidth with few. The controller keeps the
//! sizes of the last completed files, maps their median to a pool size and
//! asks the pool to resize when the change exceeds the hysteresis.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::PipelineState;
use crate::download::PoolHandle;
use crate::units::format_bytes;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// Median size to share-of-range breakpoints, ascending by size.
const CURVE: [(u64, f64); 4] = [
    (512 * KIB, 1.0),
    (5 * MIB, 0.6),
    (50 * MIB, 0.25),
    (500 * MIB, 0.0),
];

/// Sliding window of completed-file sizes shared by every worker.
#[derive(Debug)]
pub struct SizeWindow {
    samples: Mutex<VecDeque<u64>>,
    capacity: usize,
}

impl SizeWindow {
    /// Keeps the last `capacity` samples.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Records the size of a completed file.
    pub fn record(&self, bytes: u64) {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(bytes);
    }

    /// Number of samples held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true when no sample was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Median of the held samples (upper median for even counts).
    #[must_use]
    pub fn median(&self) -> Option<u64> {
        let mut sorted: Vec<u64> = self
            .samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_unstable();
        Some(sorted[sorted.len() / 2])
    }
}

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Samples required before the first recommendation.
    pub min_samples: usize,
    /// Time between evaluations.
    pub interval: Duration,
    /// Minimum absolute change worth applying.
    pub hysteresis: usize,
    /// Lower pool bound.
    pub min_workers: usize,
    /// Upper pool bound.
    pub max_workers: usize,
}

/// Maps a median file size to a worker count in `[min, max]`.
///
/// Monotonically non-increasing in `median`.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn recommend_workers(median: u64, min_workers: usize, max_workers: usize) -> usize {
    let (low, high) = if min_workers <= max_workers {
        (min_workers, max_workers)
    } else {
        (max_workers, min_workers)
    };
    let share = curve_share(median);
    let span = (high - low) as f64;
    low + (share * span).round() as usize
}

#[allow(clippy::cast_precision_loss)]
fn curve_share(median: u64) -> f64 {
    let (first_size, first_share) = CURVE[0];
    if median <= first_size {
        return first_share;
    }
    for pair in CURVE.windows(2) {
        let (x0, y0) = pair[0];
        let (x1, y1) = pair[1];
        if median <= x1 {
            let t = (median - x0) as f64 / (x1 - x0) as f64;
            return y0 + (y1 - y0) * t;
        }
    }
    CURVE[CURVE.len() - 1].1
}

/// Periodically retunes the download pool.
#[derive(Debug)]
pub struct ConcurrencyController {
    settings: ControllerSettings,
    window: Arc<SizeWindow>,
}

impl ConcurrencyController {
    /// Creates a controller reading `window`.
    #[must_use]
    pub fn new(settings: ControllerSettings, window: Arc<SizeWindow>) -> Self {
        Self { settings, window }
    }

    /// Returns the new pool size if one should be applied.
    #[must_use]
    pub fn evaluate(&self, current: usize) -> Option<usize> {
        if self.window.len() < self.settings.min_samples {
            return None;
        }
        let median = self.window.median()?;
        let target = recommend_workers(
            median,
            self.settings.min_workers,
            self.settings.max_workers,
        );
        debug!(
            median = %format_bytes(median),
            current,
            target,
            "concurrency evaluation"
        );
        (target.abs_diff(current) > self.settings.hysteresis).then_some(target)
    }

    /// Runs until the pool goes away or the pipeline halts.
    pub fn spawn(self, pool: PoolHandle, state: Arc<PipelineState>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = state.halted() => return,
                }
                let current = pool.size();
                if let Some(target) = self.evaluate(current) {
                    info!(current, target, "resizing download pool");
                    if !pool.request_resize(target).await {
                        return;
                    }
                }
            }
        })
    }
}
