//! FIFO of deferred work items.

use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::thread::Thread;

/// A unit of deferred work posted from interrupt context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItem {
    /// The user pressed the capture button: arm the sensor.
    ArmCapture,
    /// The sensor finished writing a frame: extract and persist it.
    ProcessFrame,
}

/// Bounded multi-producer, single-consumer work queue.
///
/// Slots are preallocated, so [`EventQueue::post`] never allocates and
/// completes in constant time. A post that finds the queue full drops
/// the item and counts it instead of blocking the interrupt.
pub struct EventQueue {
    items: ArrayQueue<WorkItem>,
    posted: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicBool,
    /// Dispatcher thread woken on every successful post.
    consumer: OnceLock<Thread>,
}

impl EventQueue {
    /// Creates a queue holding at most `capacity` pending items.
    ///
    /// # Panics
    /// Panics if `capacity` is 0.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: ArrayQueue::new(capacity),
            posted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            consumer: OnceLock::new(),
        }
    }

    /// Enqueues an item. Returns `false` if it was dropped.
    ///
    /// Safe to call from interrupt context.
    pub fn post(&self, item: WorkItem) -> bool {
        if self.closed.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        match self.items.push(item) {
            Ok(()) => {
                self.posted.fetch_add(1, Ordering::Relaxed);
                if let Some(consumer) = self.consumer.get() {
                    consumer.unpark();
                }
                true
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Removes the oldest item.
    pub fn pop(&self) -> Option<WorkItem> {
        self.items.pop()
    }

    /// Number of items waiting.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum number of waiting items.
    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    /// Total items accepted since creation.
    pub fn posted(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }

    /// Total items dropped because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stops accepting new items and wakes the consumer so it can drain and exit.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(consumer) = self.consumer.get() {
            consumer.unpark();
        }
    }

    /// Returns true once [`EventQueue::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Registers the thread to wake on post. Only the first registration sticks.
    pub(crate) fn bind_consumer(&self, thread: Thread) -> bool {
        self.consumer.set(thread).is_ok()
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("pending", &self.len())
            .field("capacity", &self.capacity())
            .field("posted", &self.posted())
            .field("dropped", &self.dropped())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = EventQueue::with_capacity(4);
        assert!(queue.post(WorkItem::ArmCapture));
        assert!(queue.post(WorkItem::ProcessFrame));
        assert!(queue.post(WorkItem::ArmCapture));

        assert_eq!(queue.pop(), Some(WorkItem::ArmCapture));
        assert_eq!(queue.pop(), Some(WorkItem::ProcessFrame));
        assert_eq!(queue.pop(), Some(WorkItem::ArmCapture));
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.posted(), 3);
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let queue = EventQueue::with_capacity(2);
        assert!(queue.post(WorkItem::ArmCapture));
        assert!(queue.post(WorkItem::ProcessFrame));
        assert!(!queue.post(WorkItem::ArmCapture));
        assert!(!queue.post(WorkItem::ArmCapture));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.posted(), 2);
        assert_eq!(queue.dropped(), 2);
    }

    #[test]
    fn test_closed_queue_rejects_but_drains() {
        let queue = EventQueue::with_capacity(4);
        queue.post(WorkItem::ProcessFrame);
        queue.close();

        assert!(!queue.post(WorkItem::ArmCapture));
        assert_eq!(queue.pop(), Some(WorkItem::ProcessFrame));
        assert!(queue.is_empty());
        assert_eq!(queue.dropped(), 1);
    }
}
