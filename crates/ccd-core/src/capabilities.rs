//! Camera capability records.
//!
//! Everything a driver needs to know about a camera model that the SDK does not
//! report at runtime lives in a [`CameraCapabilities`] record: sensor size, pixel
//! pitch, supported binning, cooler range, and which optional operations exist.
//!
//! A record is resolved once when the device is constructed (usually through
//! [`CameraCapabilities::for_model`]) and injected into the driver. There is no
//! process-wide table the driver consults later.
//!
//! # Example
//!
//! ```rust
//! use ccd_core::capabilities::CameraCapabilities;
//!
//! let caps = CameraCapabilities::for_model("fli-kepler:KL4040").unwrap();
//! assert_eq!(caps.pixel_size_um, (9.0, 9.0));
//! assert!(caps.can_bin);
//! ```

use crate::geometry::FrameType;
use serde::{Deserialize, Serialize};

/// Static description of a camera model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraCapabilities {
    /// Model name shown to users.
    pub model: String,
    /// Sensor width in unbinned pixels.
    pub sensor_width: u32,
    /// Sensor height in unbinned pixels.
    pub sensor_height: u32,
    /// Pixel pitch (x, y) in micrometres.
    pub pixel_size_um: (f64, f64),
    /// Bits per pixel delivered by the readout.
    pub bit_depth: u32,
    /// Whether binning other than 1x1 is supported.
    pub can_bin: bool,
    /// Maximum horizontal binning.
    pub max_bin_x: u32,
    /// Maximum vertical binning.
    pub max_bin_y: u32,
    /// Whether a readout region smaller than the sensor is supported.
    pub can_subframe: bool,
    /// Whether the camera has a regulated cooler.
    pub has_cooler: bool,
    /// Cooler setpoint range (min, max) in Celsius.
    pub temperature_range: (f64, f64),
    /// Whether the camera has an ST4 guide port.
    pub has_guide_port: bool,
    /// Whether the camera has a mechanical shutter.
    pub has_shutter: bool,
    /// Frame types the camera can capture.
    pub frame_types: Vec<FrameType>,
    /// Gain range (min, max), if gain is adjustable.
    pub gain_range: Option<(f64, f64)>,
    /// Exposure range (min, max) in seconds.
    pub exposure_range: (f64, f64),
}

/// Pixel pitch in micrometres for FLI Kepler sensors.
///
/// `None` for sensors whose pitch is not published.
fn kepler_pixel_size(sensor: &str) -> Option<(f64, u32, u32)> {
    let entry = match sensor.to_ascii_uppercase().as_str() {
        "KL400" | "GSENSE400" => (11.0, 2048, 2048),
        "KL2020" | "GSENSE2020" => (6.5, 2048, 2048),
        "KL4040" | "GSENSE4040" => (9.0, 4096, 4096),
        "KL6060" | "GSENSE6060" => (10.0, 6144, 6144),
        "DC230-42" => (15.0, 2048, 2048),
        "DC230-84" => (15.0, 2048, 4096),
        "DC4320" => (24.0, 4096, 4096),
        "IMX183" => (2.4, 5496, 3672),
        _ => return None,
    };
    Some(entry)
}

impl CameraCapabilities {
    /// Fishcamp Starfish: 1280x1024 16-bit, no binning, light frames only,
    /// TEC cooler and ST4 relay port.
    #[must_use]
    pub fn fishcamp_starfish() -> Self {
        Self {
            model: "Fishcamp Starfish".to_string(),
            sensor_width: 1280,
            sensor_height: 1024,
            pixel_size_um: (5.2, 5.2),
            bit_depth: 16,
            can_bin: false,
            max_bin_x: 1,
            max_bin_y: 1,
            can_subframe: true,
            has_cooler: true,
            temperature_range: (-55.0, 45.0),
            has_guide_port: true,
            has_shutter: false,
            frame_types: vec![FrameType::Light],
            gain_range: Some((1.0, 15.0)),
            exposure_range: (0.001, 3600.0),
        }
    }

    /// FLI Kepler with the given sensor (e.g. `"KL4040"`).
    ///
    /// Unknown sensors get a 2048x2048 default and a pixel pitch of 0, and a
    /// warning is logged.
    #[must_use]
    pub fn fli_kepler(sensor: &str) -> Self {
        let (pixel, width, height) = kepler_pixel_size(sensor).unwrap_or_else(|| {
            tracing::warn!(sensor, "Pixel size unknown for this Kepler sensor");
            (0.0, 2048, 2048)
        });
        Self {
            model: format!("FLI Kepler {}", sensor),
            sensor_width: width,
            sensor_height: height,
            pixel_size_um: (pixel, pixel),
            bit_depth: 16,
            can_bin: true,
            max_bin_x: 4,
            max_bin_y: 4,
            can_subframe: true,
            has_cooler: true,
            temperature_range: (-40.0, 20.0),
            has_guide_port: false,
            has_shutter: true,
            frame_types: vec![
                FrameType::Light,
                FrameType::Bias,
                FrameType::Dark,
                FrameType::Flat,
            ],
            gain_range: None,
            exposure_range: (0.001, 3600.0),
        }
    }

    /// Simulated cooled sensor used by tests and the demo daemon.
    #[must_use]
    pub fn simulator() -> Self {
        Self {
            model: "Simulator".to_string(),
            sensor_width: 640,
            sensor_height: 480,
            pixel_size_um: (3.75, 3.75),
            bit_depth: 16,
            can_bin: true,
            max_bin_x: 4,
            max_bin_y: 4,
            can_subframe: true,
            has_cooler: true,
            temperature_range: (-50.0, 30.0),
            has_guide_port: true,
            has_shutter: true,
            frame_types: vec![
                FrameType::Light,
                FrameType::Bias,
                FrameType::Dark,
                FrameType::Flat,
            ],
            gain_range: Some((0.0, 100.0)),
            exposure_range: (0.0001, 3600.0),
        }
    }

    /// Resolve a record from a `vendor:model` string.
    ///
    /// Recognised forms: `fishcamp`, `fishcamp:starfish`, `fli-kepler:<sensor>`,
    /// `simulator`.
    #[must_use]
    pub fn for_model(spec: &str) -> Option<Self> {
        let (vendor, model) = match spec.split_once(':') {
            Some((vendor, model)) => (vendor.trim(), Some(model.trim())),
            None => (spec.trim(), None),
        };
        match (vendor.to_ascii_lowercase().as_str(), model) {
            ("fishcamp", None) => Some(Self::fishcamp_starfish()),
            ("fishcamp", Some(m)) if m.eq_ignore_ascii_case("starfish") => {
                Some(Self::fishcamp_starfish())
            }
            ("fli-kepler" | "kepler", Some(sensor)) => {
                kepler_pixel_size(sensor).map(|_| Self::fli_kepler(sensor))
            }
            ("simulator" | "sim", None) => Some(Self::simulator()),
            _ => None,
        }
    }

    /// Whether the camera can capture this frame type.
    #[must_use]
    pub fn supports_frame_type(&self, frame_type: FrameType) -> bool {
        self.frame_types.contains(&frame_type)
    }

    /// Whether `celsius` is inside the cooler's setpoint range.
    #[must_use]
    pub fn temperature_in_range(&self, celsius: f64) -> bool {
        let (min, max) = self.temperature_range;
        celsius.is_finite() && celsius >= min && celsius <= max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_fishcamp() {
        let caps = CameraCapabilities::for_model("fishcamp").unwrap();
        assert_eq!(caps.model, "Fishcamp Starfish");
        assert!(!caps.can_bin);
        assert!(caps.has_guide_port);
        assert_eq!(caps.temperature_range, (-55.0, 45.0));
        assert_eq!(
            CameraCapabilities::for_model("fishcamp:Starfish"),
            Some(caps)
        );
    }

    #[test]
    fn test_lookup_kepler_sensors() {
        let caps = CameraCapabilities::for_model("fli-kepler:GSENSE2020").unwrap();
        assert_eq!(caps.pixel_size_um, (6.5, 6.5));
        let caps = CameraCapabilities::for_model("kepler:imx183").unwrap();
        assert_eq!((caps.sensor_width, caps.sensor_height), (5496, 3672));
        assert!(caps.supports_frame_type(FrameType::Dark));
    }

    #[test]
    fn test_lookup_unknown() {
        assert!(CameraCapabilities::for_model("fli-kepler:FTM").is_none());
        assert!(CameraCapabilities::for_model("zwo:asi294").is_none());
    }

    #[test]
    fn test_temperature_range() {
        let caps = CameraCapabilities::fli_kepler("KL400");
        assert!(caps.temperature_in_range(-40.0));
        assert!(caps.temperature_in_range(20.0));
        assert!(!caps.temperature_in_range(-41.0));
        assert!(!caps.temperature_in_range(f64::NAN));
    }
}
