//! Hardware boundary consumed by the driver core.
//!
//! A `HardwareChannel` wraps one opened camera of a vendor SDK. Implementations
//! translate SDK return codes into [`HwResult`] (see [`HardwareError::check_code`])
//! and nothing above this trait ever sees a raw code.
//!
//! # Contract
//!
//! - Methods are synchronous: vendor SDKs are blocking C libraries. Once a
//!   device is running, the driver makes every call from Tokio's blocking pool,
//!   never from an async worker thread. Only the initial `apply_geometry` at
//!   connect runs in the caller's context.
//! - Implementations must be `Send + Sync`. A readout thread and the actor loop
//!   may call into the channel at the same time (e.g. `stop_capture` while
//!   `read_frame` is blocked), so the SDK handle needs its own locking if the
//!   vendor library is not reentrant.
//! - Nothing here panics on hardware failure; every call reports through its
//!   return value.
//!
//! [`HardwareError::check_code`]: crate::error::HardwareError::check_code

use crate::error::{HardwareError, HwResult};
use crate::geometry::{FrameGeometry, FrameType};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Temperatures reported by the camera, in Celsius.
///
/// Single-sensor cameras report the same value in all three fields.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSample {
    /// Ambient (housing) temperature.
    pub ambient: f64,
    /// Heat-sink / base plate temperature.
    pub base: f64,
    /// Sensor temperature at the cold finger; the regulated value.
    pub cooler: f64,
}

impl TemperatureSample {
    /// Sample from a camera with a single temperature sensor.
    #[must_use]
    pub fn uniform(celsius: f64) -> Self {
        Self {
            ambient: celsius,
            base: celsius,
            cooler: celsius,
        }
    }
}

/// Direction of an ST4 guide pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuideDirection {
    /// +Dec
    North,
    /// -Dec
    South,
    /// +RA
    East,
    /// -RA
    West,
}

impl GuideDirection {
    /// Lowercase name used in logs and configuration.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            GuideDirection::North => "north",
            GuideDirection::South => "south",
            GuideDirection::East => "east",
            GuideDirection::West => "west",
        }
    }
}

/// Opaque capability exposing one camera of a vendor SDK.
pub trait HardwareChannel: Send + Sync {
    /// Program the integration time and begin a single capture.
    ///
    /// May fail transiently right after a previous readout; the caller retries.
    fn start_capture(&self, exposure: Duration) -> HwResult<()>;

    /// Stop (abort) the capture in progress.
    fn stop_capture(&self) -> HwResult<()>;

    /// Whether the sensor has finished integrating and the frame can be read.
    fn poll_ready(&self) -> HwResult<bool>;

    /// Transfer the captured frame into `buffer`, returning the number of bytes
    /// written. Blocks until the transfer finishes.
    fn read_frame(&self, buffer: &mut [u8]) -> HwResult<usize>;

    /// Read the camera temperatures.
    fn temperatures(&self) -> HwResult<TemperatureSample>;

    /// Program a new cooler setpoint.
    fn set_temperature_target(&self, celsius: f64) -> HwResult<()>;

    /// Current cooler power in percent of full power.
    fn cooler_duty_cycle(&self) -> HwResult<f64>;

    /// Program the readout region and binning.
    fn apply_geometry(&self, geometry: &FrameGeometry) -> HwResult<()>;

    /// Select the frame type of the next capture.
    ///
    /// # Default Implementation
    /// Accepts light frames only.
    fn set_frame_type(&self, frame_type: FrameType) -> HwResult<()> {
        match frame_type {
            FrameType::Light => Ok(()),
            other => Err(HardwareError::new(
                "set_frame_type",
                format!("{} frames not supported", other.as_str()),
            )),
        }
    }

    /// Set sensor gain.
    ///
    /// # Default Implementation
    /// Returns an error indicating gain control is not supported.
    fn set_gain(&self, gain: f64) -> HwResult<()> {
        let _ = gain;
        Err(HardwareError::new("set_gain", "gain control not supported"))
    }

    /// Pulse the ST4 guide relay for `duration`.
    ///
    /// # Default Implementation
    /// Returns an error indicating the camera has no guide port.
    fn pulse_guide(&self, direction: GuideDirection, duration: Duration) -> HwResult<()> {
        let _ = (direction, duration);
        Err(HardwareError::new("pulse_guide", "no ST4 guide port"))
    }
}
