//! Deferred work: interrupt shims post, one dispatcher thread executes.
//!
//! ```text
//! button IRQ ──┐
//!              ├─► EventQueue (FIFO, bounded) ─► Dispatcher thread ─► WorkHandler
//! sensor IRQ ──┘
//! ```
//!
//! Interrupt shims only enqueue. Frame extraction and storage writes run
//! exclusively on the dispatcher thread, one work item at a time.

mod dispatcher;
mod interrupts;
mod queue;

pub use dispatcher::{DispatchError, Dispatcher, DispatcherHandle, WorkHandler};
pub use interrupts::{in_interrupt_context, InterruptContext, InterruptShim, RequestGate};
pub use queue::{EventQueue, WorkItem};
