//! Error types for queue operations.

use std::fmt;

use thiserror::Error;

/// Reasons a queue refuses an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue holds `capacity` items already.
    #[error("queue full ({capacity} items)")]
    Full {
        /// Configured capacity.
        capacity: usize,
    },

    /// The queue was closed and accepts no new items.
    #[error("queue closed")]
    Closed,

    /// Capacity outside `1..=MAX_QUEUE_CAPACITY`.
    #[error("invalid queue capacity {value}: must be between 1 and {max}", max = super::MAX_QUEUE_CAPACITY)]
    InvalidCapacity {
        /// The rejected value.
        value: usize,
    },
}

/// An item handed back by the queue together with the reason it was refused.
pub struct Rejected<T> {
    /// Why the queue refused the item.
    pub error: QueueError,
    /// The refused item, returned to the caller.
    pub item: T,
}

impl<T> Rejected<T> {
    /// Consumes the rejection and returns the item.
    pub fn into_inner(self) -> T {
        self.item
    }
}

impl<T> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_display() {
        assert_eq!(
            QueueError::Full { capacity: 10 }.to_string(),
            "queue full (10 items)"
        );
        assert_eq!(QueueError::Closed.to_string(), "queue closed");
        assert!(
            QueueError::InvalidCapacity { value: 0 }
                .to_string()
                .contains("between 1 and 1000000")
        );
    }

    #[test]
    fn test_rejected_returns_item() {
        let rejected = Rejected {
            error: QueueError::Closed,
            item: 7_u32,
        };
        assert_eq!(rejected.to_string(), "queue closed");
        assert_eq!(rejected.into_inner(), 7);
    }
}
