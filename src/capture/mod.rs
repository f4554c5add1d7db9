//! Sensor input and frame handling.
//!
//! This module provides the sensor collaborator interface, the raw
//! frame buffer the sensor fills, and the configuration for the whole
//! capture pipeline.

mod config;
mod frame;
mod sensor;

pub use config::{
    CaptureConfig, CaptureMode, ConfigError, DeviceConfig, DispatchConfig, FileConfig,
    OutputConfig, Resolution, SensorSettings, UsbConfig,
};
pub use frame::RawFrameBuffer;
pub use sensor::{MockSensor, Sensor, SensorError, SyntheticFrame};
