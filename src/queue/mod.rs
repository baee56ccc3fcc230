//! Bounded in-memory work queue between metadata fetchers and download workers.
//!
//! # Overview
//!
//! The queue system consists of:
//! - [`BoundedQueue`] - fixed-capacity FIFO with blocking `put`/`get` and a `join` barrier
//! - [`ItemDescriptor`] - one discovered file waiting to be downloaded
//! - [`Fingerprint`] - the deduplication key of an item
//! - [`QueueError`] - reasons the queue refuses work
//!
//! The queue length is published through a `watch` channel so producers can
//! wait for fill-level changes instead of sleeping and polling.
//!
//! # Example
//!
//! ```
//! use harvester_core::queue::BoundedQueue;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = BoundedQueue::new(2)?;
//! queue.put("a").await.map_err(|r| r.error)?;
//! assert_eq!(queue.get().await, Some("a"));
//! queue.task_done();
//! queue.join().await;
//! # Ok(())
//! # }
//! ```

mod error;
mod item;

pub use error::{QueueError, Rejected};
pub use item::{FINGERPRINT_LEN, Fingerprint, ItemDescriptor, SourceId};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::debug;

/// Largest accepted queue capacity.
pub const MAX_QUEUE_CAPACITY: usize = 1_000_000;

/// Fixed-capacity FIFO shared by producers and consumers.
///
/// `len()` never exceeds `capacity()`; every successful `put` must be matched
/// by one `task_done` once the consumer finished with the item.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    len: watch::Sender<usize>,
    unfinished: watch::Sender<usize>,
    closed: AtomicBool,
    high_water: AtomicUsize,
}

impl<T> BoundedQueue<T> {
    /// Creates an empty queue holding at most `capacity` items.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidCapacity`] unless
    /// `1 <= capacity <= MAX_QUEUE_CAPACITY`.
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 || capacity > MAX_QUEUE_CAPACITY {
            return Err(QueueError::InvalidCapacity { value: capacity });
        }
        let (len, _) = watch::channel(0);
        let (unfinished, _) = watch::channel(0);
        Ok(Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
            len,
            unfinished,
            closed: AtomicBool::new(false),
            high_water: AtomicUsize::new(0),
        })
    }

    /// Returns the configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of items currently waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        *self.len.borrow()
    }

    /// Returns true when no items are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true when the queue is at capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Largest length observed since creation.
    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }

    /// Number of items put but not yet marked done.
    #[must_use]
    pub fn unfinished(&self) -> usize {
        *self.unfinished.borrow()
    }

    /// Returns true once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Subscribes to length changes.
    #[must_use]
    pub fn watch_len(&self) -> watch::Receiver<usize> {
        self.len.subscribe()
    }

    /// Inserts an item without waiting.
    ///
    /// # Errors
    ///
    /// Hands the item back with [`QueueError::Full`] at capacity or
    /// [`QueueError::Closed`] after [`close`](Self::close).
    pub fn try_put(&self, item: T) -> Result<(), Rejected<T>> {
        if self.is_closed() {
            return Err(Rejected {
                error: QueueError::Closed,
                item,
            });
        }
        let mut items = self.lock_items();
        if items.len() >= self.capacity {
            return Err(Rejected {
                error: QueueError::Full {
                    capacity: self.capacity,
                },
                item,
            });
        }
        items.push_back(item);
        let len = items.len();
        self.unfinished.send_modify(|count| *count += 1);
        self.len.send_replace(len);
        self.high_water.fetch_max(len, Ordering::SeqCst);
        Ok(())
    }

    /// Inserts an item, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Hands the item back with [`QueueError::Closed`] if the queue is closed
    /// before space frees up.
    pub async fn put(&self, item: T) -> Result<(), Rejected<T>> {
        let mut item = item;
        let mut len_rx = self.len.subscribe();
        loop {
            match self.try_put(item) {
                Ok(()) => return Ok(()),
                Err(Rejected {
                    error: QueueError::Full { .. },
                    item: returned,
                }) => {
                    item = returned;
                    let capacity = self.capacity;
                    let closed = &self.closed;
                    let _ = len_rx
                        .wait_for(|len| *len < capacity || closed.load(Ordering::SeqCst))
                        .await
                        .map(|_| ());
                }
                Err(rejected) => return Err(rejected),
            }
        }
    }

    /// Removes the oldest item without waiting.
    pub fn try_get(&self) -> Option<T> {
        let mut items = self.lock_items();
        let item = items.pop_front()?;
        self.len.send_replace(items.len());
        Some(item)
    }

    /// Removes the oldest item, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn get(&self) -> Option<T> {
        let mut len_rx = self.len.subscribe();
        loop {
            if let Some(item) = self.try_get() {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }
            let closed = &self.closed;
            let _ = len_rx
                .wait_for(|len| *len > 0 || closed.load(Ordering::SeqCst))
                .await
                .map(|_| ());
        }
    }

    /// Marks one previously retrieved item as processed.
    pub fn task_done(&self) {
        self.unfinished
            .send_modify(|count| *count = count.saturating_sub(1));
    }

    /// Waits until every item ever put has been marked done.
    pub async fn join(&self) {
        let mut rx = self.unfinished.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await.map(|_| ());
    }

    /// Waits until the queue length drops to `threshold` or below.
    pub async fn wait_len_at_most(&self, threshold: usize) {
        let mut rx = self.len.subscribe();
        let _ = rx.wait_for(|len| *len <= threshold).await.map(|_| ());
    }

    /// Rejects further puts and wakes every waiter.
    ///
    /// Items already queued can still be retrieved.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(remaining = self.len(), "queue closed");
        }
        self.len.send_modify(|_| {});
    }

    /// Discards every waiting item, marking each as done.
    ///
    /// Returns the number of discarded items.
    pub fn clear(&self) -> usize {
        let mut items = self.lock_items();
        let discarded = items.len();
        items.clear();
        self.len.send_replace(0);
        drop(items);
        self.unfinished
            .send_modify(|count| *count = count.saturating_sub(discarded));
        discarded
    }

    fn lock_items(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
