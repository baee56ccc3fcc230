//! Producer-side throttling on queue fill level.

use tracing::{info, warn};

use crate::pipeline::PipelineState;
use crate::queue::BoundedQueue;

const EPSILON: f64 = 1e-9;

/// Pause and resume fractions of queue capacity, `low < high`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueThresholds {
    /// Resume once the queue holds at most this fraction.
    pub low: f64,
    /// Pause once the queue holds at least this fraction.
    pub high: f64,
}

impl Default for QueueThresholds {
    fn default() -> Self {
        Self {
            low: 0.2,
            high: 0.8,
        }
    }
}

impl QueueThresholds {
    /// Length at which producers pause; at least 1.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn high_mark(&self, capacity: usize) -> usize {
        let mark = (self.high * capacity as f64 - EPSILON).ceil().max(1.0) as usize;
        mark.min(capacity)
    }

    /// Length at which paused producers resume.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn low_mark(&self, capacity: usize) -> usize {
        let mark = (self.low * capacity as f64 + EPSILON).floor().max(0.0) as usize;
        mark.min(self.high_mark(capacity).saturating_sub(1))
    }
}

/// Waits while the queue is at or above the high mark, until it drains to
/// the low mark.
///
/// Returns false if the pipeline halted while waiting.
pub async fn wait_for_room<T>(
    queue: &BoundedQueue<T>,
    thresholds: QueueThresholds,
    state: &PipelineState,
    creator: &str,
) -> bool {
    if state.is_halted() {
        return false;
    }
    let capacity = queue.capacity();
    let high = thresholds.high_mark(capacity);
    if queue.len() < high {
        return true;
    }

    let low = thresholds.low_mark(capacity);
    warn!(creator, queue_len = queue.len(), capacity, "pausing fetcher");
    tokio::select! {
        () = queue.wait_len_at_most(low) => {}
        () = state.halted() => return false,
    }
    info!(creator, queue_len = queue.len(), capacity, "resuming fetcher");
    true
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::pipeline::HaltReason;

    #[test]
    fn test_marks_for_small_queue() {
        let t = QueueThresholds::default();
        assert_eq!(t.high_mark(10), 8);
        assert_eq!(t.low_mark(10), 2);
        assert_eq!(t.high_mark(2500), 2000);
        assert_eq!(t.low_mark(2500), 500);
    }

    #[test]
    fn test_marks_stay_ordered_on_tiny_queue() {
        let t = QueueThresholds::default();
        assert_eq!(t.high_mark(1), 1);
        assert_eq!(t.low_mark(1), 0);
        assert_eq!(t.high_mark(3), 3);
        assert_eq!(t.low_mark(3), 0);
    }

    #[tokio::test]
    async fn test_pauses_at_high_and_resumes_at_low() {
        let queue = Arc::new(BoundedQueue::new(10).unwrap());
        let state = Arc::new(PipelineState::new());
        for i in 0..8 {
            queue.try_put(i).unwrap();
        }

        let waiter = {
            let queue = Arc::clone(&queue);
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                wait_for_room(&queue, QueueThresholds::default(), &state, "c").await
            })
        };

        while queue.len() > 3 {
            queue.try_get().unwrap();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        queue.try_get().unwrap();
        let resumed = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(resumed);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_below_high_mark_does_not_wait() {
        let queue = BoundedQueue::new(10).unwrap();
        for i in 0..7 {
            queue.try_put(i).unwrap();
        }
        let state = PipelineState::new();
        assert!(wait_for_room(&queue, QueueThresholds::default(), &state, "c").await);
    }

    #[tokio::test]
    async fn test_halt_releases_paused_producer() {
        let queue = Arc::new(BoundedQueue::new(10).unwrap());
        for i in 0..10 {
            queue.try_put(i).unwrap();
        }
        let state = Arc::new(PipelineState::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                wait_for_room(&queue, QueueThresholds::default(), &state, "c").await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        state.halt(HaltReason::Interrupted);
        let resumed = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!resumed);
    }
}
