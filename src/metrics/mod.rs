//! Prometheus metrics for the capture pipeline.
//!
//! This module provides observability into capture, dispatch and the
//! shared block device by exposing metrics in Prometheus format,
//! optionally over HTTP.
//!
//! # Metrics Exposed
//!
//! ## Capture Metrics
//! - `flash_capture_attempts_total` - Capture attempts (sequence numbers used)
//! - `flash_capture_stored_total` - Captures written to flash
//! - `flash_capture_extraction_failures_total` - Frames with no complete payload
//! - `flash_capture_storage_failures_total` - Filesystem failures
//! - `flash_capture_bytes_stored_total` - Payload bytes written
//! - `flash_capture_button_drops_total` - Presses dropped while busy
//!
//! ## Dispatch Metrics
//! - `flash_capture_queue_depth` - Work items waiting
//! - `flash_capture_queue_drops_total` - Work items dropped on a full queue
//!
//! ## Block Device Metrics
//! - `flash_capture_usb_requests_total` - Host sector requests served
//! - `flash_capture_usb_errors_total` - Host requests that failed
//! - `flash_capture_arbiter_filesystem_acquisitions_total`
//! - `flash_capture_arbiter_usb_acquisitions_total`
//! - `flash_capture_arbiter_contended_total` - Acquisitions that waited
//!
//! The HTTP exporter (`/metrics`, `/health`) requires the `metrics` feature.
//!
//! # Example
//!
//! ```no_run
//! use flash_capture::metrics::{MetricsRegistry, MetricsSnapshot};
//!
//! let registry = MetricsRegistry::new().expect("Failed to create registry");
//!
//! let snapshot = MetricsSnapshot {
//!     capture_attempts: 3,
//!     captures_stored: 2,
//!     extraction_failures: 1,
//!     ..Default::default()
//! };
//!
//! registry.update(&snapshot);
//! println!("{}", registry.encode().unwrap());
//! ```

mod collector;
#[cfg(feature = "metrics")]
mod server;

pub use collector::{MetricsError, MetricsRegistry, MetricsSnapshot};
#[cfg(feature = "metrics")]
pub use server::{MetricsServer, ServerError};
