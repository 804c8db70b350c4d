//! `ccd-driver`
//!
//! Exposure lifecycle, cooler regulation and frame buffer management for one
//! camera, scheduled by a single device actor.
//!
//! ## Modules
//!
//! - [`exposure`]: [`ExposureController`] state machine (request, countdown,
//!   final approach, readout, abort)
//! - [`temperature`]: [`TemperatureRegulator`] poll loop with report hysteresis
//! - [`frame_buffer`]: [`FrameBufferManager`] and its RAII write guard
//! - [`device`]: [`CameraDevice`] actor and the [`CameraHandle`] used to drive it
//!
//! ## Example
//!
//! ```rust,no_run
//! use ccd_core::{CameraCapabilities, DeviceEvent, DriverConfig};
//! use ccd_driver::CameraDevice;
//! use ccd_driver_mock::MockHardware;
//! use std::sync::Arc;
//!
//! # async fn run() -> ccd_core::CameraResult<()> {
//! let caps = CameraCapabilities::simulator();
//! let hardware = Arc::new(MockHardware::new(caps.clone()));
//! let (camera, mut events) = CameraDevice::spawn(hardware, caps, &DriverConfig::default())?;
//!
//! camera.request_exposure(0.5).await?;
//! while let Some(event) = events.recv().await {
//!     if let DeviceEvent::ExposureDone { byte_count, .. } = event {
//!         println!("read {} bytes", byte_count);
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod blocking;
pub mod device;
pub mod exposure;
pub mod frame_buffer;
pub mod temperature;

pub use device::{CameraDevice, CameraHandle, DeviceCommand, DeviceStatus};
pub use exposure::{ControllerMessage, ExposureController, ExposureRequest, ExposureState};
pub use frame_buffer::{FrameBuffer, FrameBufferManager, FrameSnapshot, FrameWriteGuard};
pub use temperature::{CoolerSample, SetTargetOutcome, TemperatureRegulator, TemperatureSetpoint};
