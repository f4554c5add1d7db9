//! Interrupt-context shims.
//!
//! A shim is the whole body of an interrupt handler: it posts one work
//! item and returns. Nothing here allocates, blocks or logs.

use super::queue::{EventQueue, WorkItem};
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

thread_local! {
    static IN_INTERRUPT: Cell<bool> = const { Cell::new(false) };
}

/// Returns true while the current thread is executing an interrupt shim.
pub fn in_interrupt_context() -> bool {
    IN_INTERRUPT.with(Cell::get)
}

/// Marks the current thread as running in interrupt context until dropped.
pub struct InterruptContext {
    previous: bool,
    // Tied to the thread whose flag it set.
    _not_send: PhantomData<*const ()>,
}

impl InterruptContext {
    /// Enters interrupt context.
    pub fn enter() -> Self {
        let previous = IN_INTERRUPT.with(|flag| flag.replace(true));
        Self {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Drop for InterruptContext {
    fn drop(&mut self) {
        IN_INTERRUPT.with(|flag| flag.set(self.previous));
    }
}

/// Admits at most one outstanding capture request.
///
/// The button shim claims the gate before posting; the orchestrator
/// releases it when the cycle returns to idle. Presses that find the
/// gate claimed are dropped and counted.
#[derive(Debug, Default)]
pub struct RequestGate {
    outstanding: AtomicBool,
    dropped: AtomicU64,
}

impl RequestGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the gate. Returns false (and counts a drop) if already claimed.
    pub fn try_claim(&self) -> bool {
        let claimed = self
            .outstanding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !claimed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        claimed
    }

    /// Reopens the gate for the next request.
    pub fn release(&self) {
        self.outstanding.store(false, Ordering::Release);
    }

    /// Returns true while a capture request is in flight.
    pub fn is_outstanding(&self) -> bool {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Number of requests rejected while one was in flight.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Interrupt handler body that posts a fixed work item.
#[derive(Clone)]
pub struct InterruptShim {
    queue: Arc<EventQueue>,
    item: WorkItem,
    gate: Option<Arc<RequestGate>>,
}

impl InterruptShim {
    /// Shim for the capture button: posts [`WorkItem::ArmCapture`] through the request gate.
    pub fn button(queue: Arc<EventQueue>, gate: Arc<RequestGate>) -> Self {
        Self {
            queue,
            item: WorkItem::ArmCapture,
            gate: Some(gate),
        }
    }

    /// Shim for the sensor's frame-complete interrupt: posts [`WorkItem::ProcessFrame`].
    pub fn frame_ready(queue: Arc<EventQueue>) -> Self {
        Self {
            queue,
            item: WorkItem::ProcessFrame,
            gate: None,
        }
    }

    /// Runs the shim. Returns true if a work item was posted.
    pub fn fire(&self) -> bool {
        let _irq = InterruptContext::enter();

        if let Some(gate) = &self.gate {
            if !gate.try_claim() {
                return false;
            }
        }

        let posted = self.queue.post(self.item);
        if !posted {
            if let Some(gate) = &self.gate {
                gate.release();
            }
        }
        posted
    }

    /// The work item this shim posts.
    pub fn item(&self) -> WorkItem {
        self.item
    }
}

impl std::fmt::Debug for InterruptShim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptShim")
            .field("item", &self.item)
            .field("gated", &self.gate.is_some())
            .finish()
    }
}
