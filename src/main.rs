//! Flash Capture simulator
//!
//! Runs the capture pipeline against a mock sensor, an in-memory flash
//! device and a simulated USB host. Button presses are generated on a
//! timer; the main thread services the host like the firmware's main loop.

use clap::Parser;
use flash_capture::{
    app::bring_up,
    capture::{FileConfig, MockSensor},
    metrics::{MetricsRegistry, MetricsSnapshot},
    storage::{FlatFileSystem, Geometry, MemBlockDevice},
    usb::{SimulatedHost, UsbStats},
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "flash-capture", version, about = "Snapshot capture to shared flash")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of button presses to simulate (0 runs until Ctrl-C)
    #[arg(short = 'n', long, default_value_t = 5)]
    captures: u32,

    /// Delay between simulated button presses
    #[arg(long, default_value_t = 500)]
    press_interval_ms: u64,

    /// Drop the end marker from every n-th frame (0 never)
    #[arg(long, default_value_t = 0)]
    corrupt_every: u64,

    /// Seed for synthetic frames and host traffic
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Serve Prometheus metrics on this port (overrides the config file)
    #[arg(long)]
    metrics_port: Option<u16>,
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match FileConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => FileConfig::default(),
    };
    if let Some(port) = args.metrics_port {
        config.output.metrics_port = port;
    }

    info!("Flash Capture v{}", flash_capture::VERSION);
    info!("Simulated board: mock sensor, in-memory flash, simulated USB host");

    match run(&args, &config) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Runs the board until the presses are done or Ctrl-C. Returns false on a fatal error.
fn run(args: &Args, config: &FileConfig) -> Result<bool, Box<dyn std::error::Error>> {
    let device = MemBlockDevice::new(Geometry::from(&config.device));
    let sensor = MockSensor::new(config.capture.frame_buffer_capacity)
        .with_corrupt_every(args.corrupt_every)
        .with_seed(args.seed);

    let system = bring_up(config, device, FlatFileSystem::from(&config.device), sensor)?;
    let mut usb = system.export_usb(SimulatedHost::new(args.seed), config.usb.sector_size)?;

    let (dispatcher, handles) = system.into_dispatcher();
    let stats = dispatcher.handler().stats();
    let running_dispatcher = dispatcher.spawn()?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        })?;
    }

    let presses = {
        let running = Arc::clone(&running);
        let button = handles.button.clone();
        let captures = args.captures;
        let interval = Duration::from_millis(args.press_interval_ms);
        thread::Builder::new().name("button".into()).spawn(move || {
            let mut pressed = 0u32;
            while running.load(Ordering::SeqCst) && (captures == 0 || pressed < captures) {
                thread::sleep(interval);
                button.fire();
                pressed += 1;
            }
        })?
    };

    let registry = Arc::new(MetricsRegistry::new()?);
    #[cfg(feature = "metrics")]
    start_metrics_server(config.output.metrics_port, &registry)?;
    #[cfg(not(feature = "metrics"))]
    if config.output.metrics_port != 0 {
        warn!("Built without the `metrics` feature; not serving metrics");
    }

    let publish = |usb_stats: UsbStats| {
        let snapshot = MetricsSnapshot::from_components(
            &stats.snapshot(),
            &handles.queue,
            &handles.gate,
            &handles.arbiter.stats(),
            &usb_stats,
        );
        registry.update(&snapshot);
    };

    let poll_interval = Duration::from_millis(config.usb.poll_interval_ms);
    let refresh = Duration::from_millis(config.output.metrics_refresh_ms);
    let mut last_refresh = Instant::now();
    let mut healthy = true;

    // Main loop: serve the host until the presses finish and the last capture settles.
    while running.load(Ordering::SeqCst)
        && !running_dispatcher.is_finished()
        && (!presses.is_finished() || handles.gate.is_outstanding() || !handles.queue.is_empty())
    {
        match usb.process() {
            Ok(true) => {}
            Ok(false) => thread::sleep(poll_interval),
            Err(e) if e.is_fatal() => {
                error!(error = %e, "USB export stopped");
                healthy = false;
                break;
            }
            Err(e) => warn!(error = %e, "USB request failed"),
        }

        if last_refresh.elapsed() >= refresh {
            publish(usb.stats());
            last_refresh = Instant::now();
        }
    }

    running.store(false, Ordering::SeqCst);
    if presses.join().is_err() {
        warn!("Button thread panicked");
    }

    let mut orchestrator = match running_dispatcher.shutdown() {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!(error = %e, "Dispatcher stopped");
            return Ok(false);
        }
    };

    publish(usb.stats());
    let summary = stats.snapshot();
    info!(
        attempts = summary.attempts,
        stored = summary.stored,
        extraction_failures = summary.extraction_failures,
        storage_failures = summary.storage_failures,
        bytes = summary.bytes_stored,
        dropped_presses = handles.gate.dropped() + summary.busy_drops,
        "Capture summary"
    );
    let usb_stats = usb.stats();
    info!(
        reads = usb_stats.reads,
        writes = usb_stats.writes,
        errors = usb_stats.errors,
        contended = handles.arbiter.stats().contended,
        "USB export summary"
    );
    match orchestrator.storage_mut().list_directory() {
        Ok(names) => info!("Files on flash: {}", names.join(" ")),
        Err(e) => warn!(error = %e, "Final directory listing failed"),
    }
    tracing::debug!("Final metrics:\n{}", registry.encode()?);

    Ok(healthy)
}

#[cfg(feature = "metrics")]
fn start_metrics_server(
    port: u16,
    registry: &Arc<MetricsRegistry>,
) -> Result<(), Box<dyn std::error::Error>> {
    if port != 0 {
        flash_capture::metrics::MetricsServer::on_port(port, Arc::clone(registry)).spawn()?;
    }
    Ok(())
}
