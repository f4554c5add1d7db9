//! Single-consumer dispatcher thread.

use super::queue::{EventQueue, WorkItem};
use crate::error::CaptureError;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Errors that end the dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("fatal error in work item {item:?}: {source}")]
    Fatal {
        item: WorkItem,
        #[source]
        source: CaptureError,
    },
    #[error("dispatcher thread panicked")]
    Panicked,
    #[error("failed to spawn dispatcher thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Executes work items on the dispatcher thread.
///
/// Recoverable failures are handled inside `handle`; an `Err` return
/// is fatal and stops the dispatcher.
pub trait WorkHandler: Send {
    /// Runs one work item to completion.
    fn handle(&mut self, item: WorkItem) -> Result<(), CaptureError>;
}

/// Drains an [`EventQueue`] in insertion order, one item at a time.
pub struct Dispatcher<H> {
    queue: Arc<EventQueue>,
    handler: H,
    idle_wait: Duration,
}

impl<H: WorkHandler> Dispatcher<H> {
    pub fn new(queue: Arc<EventQueue>, handler: H) -> Self {
        Self {
            queue,
            handler,
            idle_wait: Duration::from_millis(50),
        }
    }

    /// Sets the longest sleep between wake-ups.
    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    /// Runs every item currently queued, including items posted while draining.
    ///
    /// Returns the number of items executed.
    pub fn run_pending(&mut self) -> Result<usize, DispatchError> {
        let mut executed = 0;
        while let Some(item) = self.queue.pop() {
            tracing::trace!(?item, pending = self.queue.len(), "Dispatching work item");
            self.handler
                .handle(item)
                .map_err(|source| DispatchError::Fatal { item, source })?;
            executed += 1;
        }
        Ok(executed)
    }

    /// Dispatches until the queue is closed and drained, then returns the handler.
    pub fn run(mut self) -> Result<H, DispatchError> {
        if !self.queue.bind_consumer(thread::current()) {
            tracing::warn!("Event queue already has a consumer; relying on idle wake-ups");
        }

        loop {
            self.run_pending()?;
            if self.queue.is_closed() && self.queue.is_empty() {
                break;
            }
            // A post between the drain and here leaves an unpark token, so this returns at once.
            thread::park_timeout(self.idle_wait);
        }

        tracing::debug!(posted = self.queue.posted(), "Dispatcher stopped");
        Ok(self.handler)
    }

    /// Returns the handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Returns the handler mutably.
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }
}

impl<H: WorkHandler + 'static> Dispatcher<H> {
    /// Moves the dispatcher onto its own thread.
    pub fn spawn(self) -> Result<DispatcherHandle<H>, DispatchError> {
        let queue = Arc::clone(&self.queue);
        let join = thread::Builder::new()
            .name("dispatcher".into())
            .spawn(move || self.run())?;
        Ok(DispatcherHandle { queue, join })
    }
}

/// Handle to a running dispatcher thread.
pub struct DispatcherHandle<H> {
    queue: Arc<EventQueue>,
    join: JoinHandle<Result<H, DispatchError>>,
}

impl<H> DispatcherHandle<H> {
    /// Returns true once the thread has exited (normally or on a fatal error).
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Closes the queue, waits for the backlog to drain and returns the handler.
    pub fn shutdown(self) -> Result<H, DispatchError> {
        self.queue.close();
        self.join.join().map_err(|_| DispatchError::Panicked)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ArbiterViolation;
    use crate::storage::Client;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<WorkItem>,
        fail_on: Option<usize>,
    }

    impl WorkHandler for Recorder {
        fn handle(&mut self, item: WorkItem) -> Result<(), CaptureError> {
            self.seen.push(item);
            if self.fail_on == Some(self.seen.len()) {
                return Err(CaptureError::Arbiter(ArbiterViolation::InterruptContext {
                    client: Client::FileSystem,
                }));
            }
            Ok(())
        }
    }

    #[test]
    fn test_run_pending_preserves_order() {
        let queue = Arc::new(EventQueue::with_capacity(8));
        queue.post(WorkItem::ArmCapture);
        queue.post(WorkItem::ProcessFrame);
        queue.post(WorkItem::ArmCapture);

        let mut dispatcher = Dispatcher::new(Arc::clone(&queue), Recorder::default());
        assert_eq!(dispatcher.run_pending().unwrap(), 3);
        assert_eq!(
            dispatcher.handler().seen,
            vec![
                WorkItem::ArmCapture,
                WorkItem::ProcessFrame,
                WorkItem::ArmCapture
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fatal_error_stops_dispatch() {
        let queue = Arc::new(EventQueue::with_capacity(8));
        queue.post(WorkItem::ArmCapture);
        queue.post(WorkItem::ProcessFrame);
        queue.post(WorkItem::ArmCapture);

        let handler = Recorder {
            fail_on: Some(2),
            ..Default::default()
        };
        let mut dispatcher = Dispatcher::new(Arc::clone(&queue), handler);
        let err = dispatcher.run_pending().unwrap_err();

        assert!(matches!(
            err,
            DispatchError::Fatal {
                item: WorkItem::ProcessFrame,
                ..
            }
        ));
        // The third item was never executed.
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_spawned_dispatcher_drains_on_shutdown() {
        let queue = Arc::new(EventQueue::with_capacity(64));
        let handle = Dispatcher::new(Arc::clone(&queue), Recorder::default())
            .with_idle_wait(Duration::from_millis(5))
            .spawn()
            .unwrap();

        for _ in 0..20 {
            queue.post(WorkItem::ProcessFrame);
        }

        let recorder = handle.shutdown().unwrap();
        assert_eq!(recorder.seen.len(), 20);
        assert!(queue.is_empty());
    }
}
