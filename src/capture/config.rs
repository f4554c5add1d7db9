//! Capture, device and export configuration.
//!
//! Defaults match the reference board: an OV5640 in JPEG snapshot mode
//! and a 448 KiB internal-flash region exported over USB.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Sensor output resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// 160x120
    Qqvga,
    /// 320x240
    Qvga,
    /// 640x480
    #[default]
    Vga,
    /// 1280x720
    Hd720,
}

impl Resolution {
    /// Returns (width, height) in pixels.
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            Resolution::Qqvga => (160, 120),
            Resolution::Qvga => (320, 240),
            Resolution::Vga => (640, 480),
            Resolution::Hd720 => (1280, 720),
        }
    }
}

/// How the sensor delivers frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// One frame per arm request.
    #[default]
    Snapshot,
    /// Free-running frames.
    Video,
}

/// Settings handed to the sensor driver at initialisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Output resolution.
    pub resolution: Resolution,
    /// Frames per second.
    pub frame_rate: u32,
    /// Enable on-sensor JPEG compression.
    pub jpeg: bool,
    /// Snapshot or video mode.
    pub mode: CaptureMode,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            resolution: Resolution::Vga,
            frame_rate: 15,
            jpeg: true,
            mode: CaptureMode::Snapshot,
        }
    }
}

/// Configuration for the capture pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Drive the flash LED during each snapshot.
    pub flash_enabled: bool,
    /// Raw frame buffer capacity in bytes.
    pub frame_buffer_capacity: usize,
    /// Budget for extract + persist in milliseconds (0 disables the check).
    pub processing_timeout_ms: u64,
    /// Mount point name of the flash filesystem.
    pub mount_point: String,
    /// Sensor driver settings.
    pub sensor: SensorSettings,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            flash_enabled: true,
            frame_buffer_capacity: 64 * 1024,
            processing_timeout_ms: 1000,
            mount_point: "fs".to_string(),
            sensor: SensorSettings::default(),
        }
    }
}

impl CaptureConfig {
    /// Validates the configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Room for both markers at minimum.
        if self.frame_buffer_capacity < 5 {
            return Err(ConfigError::InvalidBufferCapacity);
        }
        if self.mount_point.is_empty() || self.mount_point.contains('/') {
            return Err(ConfigError::InvalidMountPoint);
        }
        if self.sensor.frame_rate == 0 || self.sensor.frame_rate > 60 {
            return Err(ConfigError::InvalidFrameRate);
        }
        Ok(())
    }
}

/// Geometry of the flash region backing the filesystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Total size in bytes.
    pub size: u64,
    /// Minimum read unit.
    pub read_size: u64,
    /// Minimum program unit.
    pub program_size: u64,
    /// Erase block size.
    pub erase_size: u64,
    /// Erase blocks reserved for the superblock and directory.
    pub directory_blocks: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            size: 0x70000,
            read_size: 1,
            program_size: 8,
            erase_size: 2048,
            directory_blocks: 4,
        }
    }
}

impl DeviceConfig {
    /// Validates the device geometry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let units = [self.read_size, self.program_size, self.erase_size];
        if units.iter().any(|&u| u == 0) || self.size == 0 {
            return Err(ConfigError::InvalidGeometry);
        }
        if self.erase_size % self.program_size != 0 || self.size % self.erase_size != 0 {
            return Err(ConfigError::InvalidGeometry);
        }
        if self.directory_blocks == 0 || self.directory_blocks * self.erase_size >= self.size {
            return Err(ConfigError::InvalidGeometry);
        }
        Ok(())
    }
}

/// Work queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum number of queued work items.
    pub queue_capacity: usize,
    /// Longest the dispatcher sleeps between wake-ups, in milliseconds.
    pub idle_wait_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            idle_wait_ms: 50,
        }
    }
}

/// USB mass-storage export configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbConfig {
    /// Logical sector size presented to the host.
    pub sector_size: u64,
    /// Sleep between polls when the host is idle, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            sector_size: 512,
            poll_interval_ms: 5,
        }
    }
}

/// Full configuration file format.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub usb: UsbConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Metrics server port (0 to disable).
    pub metrics_port: u16,
    /// Interval between metrics refreshes, in milliseconds.
    pub metrics_refresh_ms: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            metrics_port: 0,
            metrics_refresh_ms: 1000,
        }
    }
}

impl FileConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileReadError(e.to_string()))?;
        let config: FileConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.capture.validate()?;
        self.device.validate()?;
        if self.dispatch.queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity);
        }
        let sector = self.usb.sector_size;
        if sector == 0
            || sector % self.device.program_size != 0
            || self.device.erase_size % sector != 0
        {
            return Err(ConfigError::InvalidSectorSize(sector));
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("frame buffer capacity too small")]
    InvalidBufferCapacity,
    #[error("mount point must be a single non-empty path component")]
    InvalidMountPoint,
    #[error("invalid frame rate (must be 1-60 fps)")]
    InvalidFrameRate,
    #[error("invalid block device geometry")]
    InvalidGeometry,
    #[error("work queue capacity must be non-zero")]
    InvalidQueueCapacity,
    #[error("sector size {0} does not fit the device geometry")]
    InvalidSectorSize(u64),
    #[error("failed to read config file: {0}")]
    FileReadError(String),
    #[error("failed to parse config file: {0}")]
    ParseError(String),
}
