//! Shared run state: the halt signal and the pipeline counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

/// Why the pipeline stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// Free disk space dropped below the configured floor.
    LowDiskSpace,
    /// The operator interrupted the run.
    Interrupted,
    /// An unrecoverable error outside any single unit of work.
    Fatal,
}

impl HaltReason {
    /// Returns true when the halt should be reported as a process failure.
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Fatal)
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LowDiskSpace => f.write_str("low disk space"),
            Self::Interrupted => f.write_str("interrupted"),
            Self::Fatal => f.write_str("fatal error"),
        }
    }
}

/// Lifecycle phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Producers and workers are active.
    Running,
    /// Every producer finished; workers empty the backlog.
    Draining,
    /// Halted. Workers drop remaining items without downloading them.
    Stopped(HaltReason),
}

impl RunState {
    /// Returns true for [`RunState::Stopped`].
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped(_))
    }
}

/// Final counts of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineSummary {
    /// New items accepted into the queue.
    pub discovered: u64,
    /// Files published to final storage.
    pub downloaded: u64,
    /// Items recognised as already present.
    pub skipped: u64,
    /// Items abandoned after an error.
    pub failed: u64,
    /// New items discarded because the queue was full.
    pub dropped: u64,
    /// Bytes published to final storage.
    pub bytes: u64,
    /// Set when the run halted before draining.
    pub halt_reason: Option<HaltReason>,
}

/// Halt signal and counters shared by every task of a run.
///
/// `Stopped` is terminal: the first halt reason wins and later calls are
/// ignored.
#[derive(Debug)]
pub struct PipelineState {
    run: watch::Sender<RunState>,
    discovered: AtomicU64,
    downloaded: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    bytes: AtomicU64,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineState {
    /// Creates a state in [`RunState::Running`] with zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        let (run, _) = watch::channel(RunState::Running);
        Self {
            run,
            discovered: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn run_state(&self) -> RunState {
        *self.run.borrow()
    }

    /// Returns true once the pipeline has been halted.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.run.borrow().is_stopped()
    }

    /// Reason of the halt, if halted.
    #[must_use]
    pub fn halt_reason(&self) -> Option<HaltReason> {
        match self.run_state() {
            RunState::Stopped(reason) => Some(reason),
            _ => None,
        }
    }

    /// Moves from `Running` to `Draining`.
    ///
    /// Returns false when the run was already draining or stopped.
    pub fn begin_draining(&self) -> bool {
        self.run.send_if_modified(|state| {
            if *state == RunState::Running {
                *state = RunState::Draining;
                true
            } else {
                false
            }
        })
    }

    /// Halts the pipeline.
    ///
    /// Returns true if this call performed the transition.
    pub fn halt(&self, reason: HaltReason) -> bool {
        let changed = self.run.send_if_modified(|state| {
            if state.is_stopped() {
                false
            } else {
                *state = RunState::Stopped(reason);
                true
            }
        });
        if changed {
            warn!(%reason, "pipeline halted");
        }
        changed
    }

    /// Resolves once the pipeline is halted.
    pub async fn halted(&self) {
        let mut rx = self.run.subscribe();
        let _ = rx.wait_for(RunState::is_stopped).await.map(|_| ());
    }

    /// Subscribes to lifecycle changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.run.subscribe()
    }

    pub(crate) fn record_discovered(&self) {
        self.discovered.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(1, Ordering::SeqCst);
        self.bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    pub(crate) fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::SeqCst);
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn summary(&self) -> PipelineSummary {
        PipelineSummary {
            discovered: self.discovered.load(Ordering::SeqCst),
            downloaded: self.downloaded.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
            bytes: self.bytes.load(Ordering::SeqCst),
            halt_reason: self.halt_reason(),
        }
    }

    /// Logs the counters at info level.
    pub fn log_summary(&self) {
        let summary = self.summary();
        info!(
            discovered = summary.discovered,
            downloaded = summary.downloaded,
            skipped = summary.skipped,
            failed = summary.failed,
            dropped = summary.dropped,
            bytes = summary.bytes,
            halt_reason = ?summary.halt_reason,
            "run summary"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_new_state_is_running() {
        let state = PipelineState::new();
        assert_eq!(state.run_state(), RunState::Running);
        assert!(!state.is_halted());
        assert_eq!(state.halt_reason(), None);
    }

    #[test]
    fn test_first_halt_reason_wins() {
        let state = PipelineState::new();
        assert!(state.halt(HaltReason::LowDiskSpace));
        assert!(!state.halt(HaltReason::Interrupted));
        assert_eq!(state.halt_reason(), Some(HaltReason::LowDiskSpace));
    }

    #[test]
    fn test_draining_only_from_running() {
        let state = PipelineState::new();
        assert!(state.begin_draining());
        assert!(!state.begin_draining());
        assert_eq!(state.run_state(), RunState::Draining);

        assert!(state.halt(HaltReason::Interrupted));
        assert!(!state.begin_draining());
        assert!(state.is_halted());
    }

    #[tokio::test]
    async fn test_halted_resolves_on_halt() {
        let state = Arc::new(PipelineState::new());
        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.halted().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        state.halt(HaltReason::Fatal);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_summary_counts() {
        let state = PipelineState::new();
        state.record_discovered();
        state.record_discovered();
        state.record_downloaded(10);
        state.record_downloaded(5);
        state.record_skipped();
        state.record_failed();
        state.record_dropped(3);

        let summary = state.summary();
        assert_eq!(summary.discovered, 2);
        assert_eq!(summary.downloaded, 2);
        assert_eq!(summary.bytes, 15);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.dropped, 3);
        assert_eq!(summary.halt_reason, None);
    }

    #[test]
    fn test_only_fatal_is_failure() {
        assert!(HaltReason::Fatal.is_failure());
        assert!(!HaltReason::LowDiskSpace.is_failure());
        assert!(!HaltReason::Interrupted.is_failure());
    }

    #[test]
    fn test_summary_serializes_reason_snake_case() {
        let state = PipelineState::new();
        state.halt(HaltReason::LowDiskSpace);
        let json = serde_json::to_string(&state.summary()).unwrap();
        assert!(json.contains("\"halt_reason\":\"low_disk_space\""), "{json}");
    }
}
