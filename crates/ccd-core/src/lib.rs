//! `ccd-core`
//!
//! Core types and traits shared by the rust-ccd camera driver crates.
//!
//! This crate holds everything that is independent of how a device is scheduled:
//! the hardware boundary, static capability records, frame geometry, the device
//! event stream, the error hierarchy and configuration.
//!
//! ## Key Types
//!
//! - [`HardwareChannel`]: the only way the driver core reaches a vendor SDK
//! - [`CameraCapabilities`]: per-model constants, injected at construction
//! - [`FrameGeometry`]: readout region and binning
//! - [`DeviceEvent`]: asynchronous notifications (progress, completion, cooler)
//! - [`CameraError`]: error type with kind classification
//! - [`DriverConfig`]: Figment-loaded tuning
//!
//! ## Example
//!
//! ```rust
//! use ccd_core::{CameraCapabilities, FrameGeometry};
//!
//! let caps = CameraCapabilities::fishcamp_starfish();
//! let geometry = FrameGeometry::full_frame(&caps);
//! assert!(geometry.validate(&caps).is_ok());
//! assert_eq!(geometry.buffer_bytes(512).unwrap(), 1280 * 1024 * 2 + 512);
//! ```

pub mod capabilities;
pub mod config;
pub mod error;
pub mod events;
pub mod geometry;
pub mod hardware;

pub use capabilities::CameraCapabilities;
pub use config::DriverConfig;
pub use error::{CameraError, CameraResult, DriverErrorKind, HardwareError, HwResult};
pub use events::{
    event_channel, CoolerStatus, DeviceEvent, EventSink, EventStream, ExposureOutcome,
    FailureReason, RegulationState,
};
pub use geometry::{FrameGeometry, FrameType};
pub use hardware::{GuideDirection, HardwareChannel, TemperatureSample};
