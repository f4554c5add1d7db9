//! Metrics collection and registry.

use crate::dispatch::{EventQueue, RequestGate};
use crate::orchestrator::CaptureStatsSnapshot;
use crate::storage::ArbiterStats;
use crate::usb::UsbStats;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use thiserror::Error;

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// A snapshot of system state for metrics update.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    /// Capture attempts (sequence numbers handed out).
    pub capture_attempts: u64,
    /// Captures written to flash.
    pub captures_stored: u64,
    pub extraction_failures: u64,
    pub storage_failures: u64,
    pub bytes_stored: u64,
    /// Button presses rejected while a capture was in flight.
    pub button_drops: u64,
    /// Items waiting in the work queue.
    pub queue_depth: usize,
    /// Items dropped because the work queue was full.
    pub queue_drops: u64,
    pub usb_requests: u64,
    pub usb_errors: u64,
    pub filesystem_acquisitions: u64,
    pub usb_acquisitions: u64,
    /// Acquisitions that waited for the other client.
    pub contended_acquisitions: u64,
}

/// Prometheus metrics registry for the capture pipeline.
pub struct MetricsRegistry {
    registry: Registry,

    // Capture metrics
    capture_attempts: IntCounter,
    captures_stored: IntCounter,
    extraction_failures: IntCounter,
    storage_failures: IntCounter,
    bytes_stored: IntCounter,
    button_drops: IntCounter,

    // Dispatch metrics
    queue_depth: IntGauge,
    queue_drops: IntCounter,

    // Block device metrics
    usb_requests: IntCounter,
    usb_errors: IntCounter,
    filesystem_acquisitions: IntCounter,
    usb_acquisitions: IntCounter,
    contended_acquisitions: IntCounter,
}

/// Raises a counter to an absolute total.
fn advance_to(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

impl MetricsRegistry {
    /// Creates a new registry with all pipeline metrics registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter, MetricsError> {
            let metric = IntCounter::new(name, help)?;
            registry.register(Box::new(metric.clone()))?;
            Ok(metric)
        };

        let capture_attempts = counter(
            "flash_capture_attempts_total",
            "Capture attempts, successful or not",
        )?;
        let captures_stored = counter(
            "flash_capture_stored_total",
            "Captures written to the filesystem",
        )?;
        let extraction_failures = counter(
            "flash_capture_extraction_failures_total",
            "Frames without a complete marker-delimited payload",
        )?;
        let storage_failures = counter(
            "flash_capture_storage_failures_total",
            "Filesystem create, write or close failures",
        )?;
        let bytes_stored = counter(
            "flash_capture_bytes_stored_total",
            "Payload bytes written to the filesystem",
        )?;
        let button_drops = counter(
            "flash_capture_button_drops_total",
            "Button presses dropped while a capture was in flight",
        )?;

        let queue_depth = IntGauge::new(
            "flash_capture_queue_depth",
            "Work items waiting for the dispatcher",
        )?;
        registry.register(Box::new(queue_depth.clone()))?;
        let queue_drops = counter(
            "flash_capture_queue_drops_total",
            "Work items dropped because the queue was full",
        )?;

        let usb_requests = counter(
            "flash_capture_usb_requests_total",
            "Host sector requests served",
        )?;
        let usb_errors = counter(
            "flash_capture_usb_errors_total",
            "Host sector requests completed with an error",
        )?;
        let filesystem_acquisitions = counter(
            "flash_capture_arbiter_filesystem_acquisitions_total",
            "Block device acquisitions by the filesystem",
        )?;
        let usb_acquisitions = counter(
            "flash_capture_arbiter_usb_acquisitions_total",
            "Block device acquisitions by the USB export",
        )?;
        let contended_acquisitions = counter(
            "flash_capture_arbiter_contended_total",
            "Block device acquisitions that had to wait",
        )?;

        Ok(Self {
            registry,
            capture_attempts,
            captures_stored,
            extraction_failures,
            storage_failures,
            bytes_stored,
            button_drops,
            queue_depth,
            queue_drops,
            usb_requests,
            usb_errors,
            filesystem_acquisitions,
            usb_acquisitions,
            contended_acquisitions,
        })
    }

    /// Updates all metrics from a snapshot of system state.
    pub fn update(&self, snapshot: &MetricsSnapshot) {
        advance_to(&self.capture_attempts, snapshot.capture_attempts);
        advance_to(&self.captures_stored, snapshot.captures_stored);
        advance_to(&self.extraction_failures, snapshot.extraction_failures);
        advance_to(&self.storage_failures, snapshot.storage_failures);
        advance_to(&self.bytes_stored, snapshot.bytes_stored);
        advance_to(&self.button_drops, snapshot.button_drops);

        self.queue_depth.set(snapshot.queue_depth as i64);
        advance_to(&self.queue_drops, snapshot.queue_drops);

        advance_to(&self.usb_requests, snapshot.usb_requests);
        advance_to(&self.usb_errors, snapshot.usb_errors);
        advance_to(&self.filesystem_acquisitions, snapshot.filesystem_acquisitions);
        advance_to(&self.usb_acquisitions, snapshot.usb_acquisitions);
        advance_to(&self.contended_acquisitions, snapshot.contended_acquisitions);
    }

    /// Returns the underlying Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl MetricsSnapshot {
    /// Creates a snapshot from the current state of the pipeline components.
    pub fn from_components(
        captures: &CaptureStatsSnapshot,
        queue: &EventQueue,
        gate: &RequestGate,
        arbiter: &ArbiterStats,
        usb: &UsbStats,
    ) -> Self {
        Self {
            capture_attempts: captures.attempts,
            captures_stored: captures.stored,
            extraction_failures: captures.extraction_failures,
            storage_failures: captures.storage_failures,
            bytes_stored: captures.bytes_stored,
            button_drops: gate.dropped() + captures.busy_drops,
            queue_depth: queue.len(),
            queue_drops: queue.dropped(),
            usb_requests: usb.requests(),
            usb_errors: usb.errors,
            filesystem_acquisitions: arbiter.filesystem_acquisitions,
            usb_acquisitions: arbiter.usb_acquisitions,
            contended_acquisitions: arbiter.contended,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::WorkItem;

    #[test]
    fn test_registry_creation() {
        let registry = MetricsRegistry::new();
        assert!(registry.is_ok());
    }

    #[test]
    fn test_metrics_update() {
        let registry = MetricsRegistry::new().unwrap();

        let snapshot = MetricsSnapshot {
            capture_attempts: 5,
            captures_stored: 4,
            extraction_failures: 1,
            bytes_stored: 48_000,
            queue_depth: 2,
            usb_requests: 120,
            contended_acquisitions: 3,
            ..Default::default()
        };
        registry.update(&snapshot);
        // Counters never go backwards.
        registry.update(&MetricsSnapshot::default());

        let output = registry.encode().unwrap();
        assert!(output.contains("flash_capture_attempts_total 5"));
        assert!(output.contains("flash_capture_stored_total 4"));
        assert!(output.contains("flash_capture_bytes_stored_total 48000"));
        assert!(output.contains("flash_capture_usb_requests_total 120"));
        assert!(output.contains("flash_capture_arbiter_contended_total 3"));
        assert!(output.contains("flash_capture_queue_depth 0"));
    }

    #[test]
    fn test_snapshot_from_components() {
        let queue = EventQueue::with_capacity(1);
        queue.post(WorkItem::ProcessFrame);
        queue.post(WorkItem::ProcessFrame);
        let gate = RequestGate::new();
        gate.try_claim();
        gate.try_claim();

        let captures = CaptureStatsSnapshot {
            attempts: 2,
            busy_drops: 1,
            ..Default::default()
        };
        let usb = UsbStats {
            reads: 3,
            writes: 1,
            errors: 1,
            ..Default::default()
        };
        let snapshot = MetricsSnapshot::from_components(
            &captures,
            &queue,
            &gate,
            &ArbiterStats::default(),
            &usb,
        );

        assert_eq!(snapshot.capture_attempts, 2);
        assert_eq!(snapshot.button_drops, 2);
        assert_eq!(snapshot.queue_depth, 1);
        assert_eq!(snapshot.queue_drops, 1);
        assert_eq!(snapshot.usb_requests, 5);
    }
}
