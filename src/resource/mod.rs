//! Disk-space guard that can halt the whole pipeline.
//!
//! The floor is the larger of an absolute minimum and a fraction of the free
//! space seen when the guard was created. Dropping below it halts the run
//! with [`HaltReason::LowDiskSpace`]; the guard never resumes afterwards.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pipeline::{HaltReason, PipelineState};
use crate::units::format_bytes;

/// Source of free-space readings.
pub trait DiskProbe: Send + Sync + std::fmt::Debug {
    /// Bytes available to unprivileged writers on the volume holding `path`.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the volume cannot be queried.
    fn available_space(&self, path: &Path) -> std::io::Result<u64>;
}

/// Reads free space from the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl DiskProbe for SystemProbe {
    fn available_space(&self, path: &Path) -> std::io::Result<u64> {
        fs2::available_space(path)
    }
}

/// Floor configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskFloor {
    /// Absolute minimum free bytes.
    pub min_free_bytes: u64,
    /// Fraction of the starting free space to keep free.
    pub min_free_fraction: f64,
}

impl Default for DiskFloor {
    fn default() -> Self {
        Self {
            min_free_bytes: 5_000_000_000,
            min_free_fraction: 0.1,
        }
    }
}

/// Watches free space on the volume holding final storage.
#[derive(Debug)]
pub struct ResourceGuard {
    probe: Arc<dyn DiskProbe>,
    path: PathBuf,
    initial_free: u64,
    floor: u64,
}

impl ResourceGuard {
    /// Takes the starting reading and derives the floor.
    ///
    /// # Errors
    ///
    /// Returns the probe's error when the first reading fails.
    pub fn new(
        probe: Arc<dyn DiskProbe>,
        path: impl Into<PathBuf>,
        floor: DiskFloor,
    ) -> std::io::Result<Self> {
        let path = path.into();
        let initial_free = probe.available_space(&path)?;
        let floor = compute_floor(initial_free, floor);
        info!(
            path = %path.display(),
            initial_free = %format_bytes(initial_free),
            floor = %format_bytes(floor),
            "disk guard armed"
        );
        Ok(Self {
            probe,
            path,
            initial_free,
            floor,
        })
    }

    /// Free bytes at creation.
    #[must_use]
    pub fn initial_free(&self) -> u64 {
        self.initial_free
    }

    /// The low-space floor in bytes.
    #[must_use]
    pub fn floor(&self) -> u64 {
        self.floor
    }

    /// Returns true while free space stays above the floor.
    ///
    /// A failed reading is logged and treated as sufficient space.
    #[must_use]
    pub fn check_free_space(&self) -> bool {
        match self.probe.available_space(&self.path) {
            Ok(free) => free > self.floor,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "free-space probe failed");
                true
            }
        }
    }

    /// Share of the usable headroom consumed since start, in `[0, 100]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn usage_percentage(&self) -> f64 {
        let Ok(current) = self.probe.available_space(&self.path) else {
            return 0.0;
        };
        let headroom = self.initial_free.saturating_sub(self.floor);
        if headroom == 0 {
            return 100.0;
        }
        let used = self.initial_free.saturating_sub(current);
        (used as f64 / headroom as f64 * 100.0).clamp(0.0, 100.0)
    }

    /// Polls every `interval` and halts `state` once space runs out.
    ///
    /// The task ends after halting or when the run halts for another reason.
    pub fn spawn_monitor(self: Arc<Self>, state: Arc<PipelineState>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if !self.check_free_space() {
                    warn!(floor = %format_bytes(self.floor), "free space below floor");
                    state.halt(HaltReason::LowDiskSpace);
                    return;
                }
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    () = state.halted() => {
                        debug!("disk monitor stopping");
                        return;
                    }
                }
            }
        })
    }
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn compute_floor(initial_free: u64, floor: DiskFloor) -> u64 {
    let fraction = floor.min_free_fraction.clamp(0.0, 1.0);
    let relative = (initial_free as f64 * fraction) as u64;
    floor.min_free_bytes.max(relative)
}

/// Probe returning a settable value, for tests.
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct FixedProbe(pub std::sync::atomic::AtomicU64);

#[cfg(test)]
impl FixedProbe {
    pub(crate) fn new(free: u64) -> Arc<Self> {
        Arc::new(Self(std::sync::atomic::AtomicU64::new(free)))
    }

    pub(crate) fn set(&self, free: u64) {
        self.0.store(free, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl DiskProbe for FixedProbe {
    fn available_space(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(self.0.load(std::sync::atomic::Ordering::SeqCst))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const GB: u64 = 1_000_000_000;

    fn guard(probe: &Arc<FixedProbe>, floor: DiskFloor) -> ResourceGuard {
        ResourceGuard::new(Arc::clone(probe) as Arc<dyn DiskProbe>, "/data", floor).unwrap()
    }

    #[test]
    fn test_floor_uses_absolute_minimum_on_small_volumes() {
        let probe = FixedProbe::new(20 * GB);
        assert_eq!(guard(&probe, DiskFloor::default()).floor(), 5 * GB);
    }

    #[test]
    fn test_floor_uses_fraction_on_large_volumes() {
        let probe = FixedProbe::new(200 * GB);
        assert_eq!(guard(&probe, DiskFloor::default()).floor(), 20 * GB);
    }

    #[test]
    fn test_check_free_space_crosses_floor() {
        let probe = FixedProbe::new(20 * GB);
        let guard = guard(&probe, DiskFloor::default());
        assert!(guard.check_free_space());
        probe.set(5 * GB);
        assert!(!guard.check_free_space());
    }

    #[test]
    fn test_usage_percentage_is_clamped() {
        let probe = FixedProbe::new(15 * GB);
        let guard = guard(&probe, DiskFloor::default());
        assert!(guard.usage_percentage().abs() < f64::EPSILON);

        probe.set(10 * GB);
        assert!((guard.usage_percentage() - 50.0).abs() < 1e-9);

        probe.set(GB);
        assert!((guard.usage_percentage() - 100.0).abs() < f64::EPSILON);

        probe.set(30 * GB);
        assert!(guard.usage_percentage().abs() < f64::EPSILON);
    }

    #[test]
    fn test_usage_percentage_without_headroom() {
        let probe = FixedProbe::new(GB);
        let guard = guard(&probe, DiskFloor::default());
        assert!((guard.usage_percentage() - 100.0).abs() < f64::EPSILON);
        assert!(!guard.check_free_space());
    }

    #[tokio::test]
    async fn test_monitor_halts_once_and_stays_stopped() {
        let probe = FixedProbe::new(20 * GB);
        let guard = Arc::new(guard(&probe, DiskFloor::default()));
        let state = Arc::new(PipelineState::new());

        let handle =
            Arc::clone(&guard).spawn_monitor(Arc::clone(&state), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!state.is_halted());

        probe.set(GB);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.halt_reason(), Some(HaltReason::LowDiskSpace));

        probe.set(100 * GB);
        assert_eq!(state.halt_reason(), Some(HaltReason::LowDiskSpace));
    }

    #[tokio::test]
    async fn test_monitor_exits_on_other_halt() {
        let probe = FixedProbe::new(20 * GB);
        let guard = Arc::new(guard(&probe, DiskFloor::default()));
        let state = Arc::new(PipelineState::new());
        let handle = guard.spawn_monitor(Arc::clone(&state), Duration::from_secs(60));
        state.halt(HaltReason::Interrupted);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.halt_reason(), Some(HaltReason::Interrupted));
    }

    #[test]
    fn test_system_probe_reads_temp_dir() {
        let free = SystemProbe.available_space(&std::env::temp_dir()).unwrap();
        assert!(free > 0);
    }
}
