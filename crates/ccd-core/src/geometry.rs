//! Frame geometry (region of interest + binning) and frame type.

use crate::capabilities::CameraCapabilities;
use crate::error::{CameraError, CameraResult};
use serde::{Deserialize, Serialize};

/// Readout region in unbinned sensor pixels, plus binning and pixel depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameGeometry {
    /// Left edge (unbinned pixels).
    pub x: u32,
    /// Top edge (unbinned pixels).
    pub y: u32,
    /// Width (unbinned pixels).
    pub width: u32,
    /// Height (unbinned pixels).
    pub height: u32,
    /// Horizontal binning factor.
    pub bin_x: u32,
    /// Vertical binning factor.
    pub bin_y: u32,
    /// Bits per pixel delivered by the readout.
    pub bit_depth: u32,
}

impl FrameGeometry {
    /// Full sensor, unbinned.
    #[must_use]
    pub fn full_frame(caps: &CameraCapabilities) -> Self {
        Self {
            x: 0,
            y: 0,
            width: caps.sensor_width,
            height: caps.sensor_height,
            bin_x: 1,
            bin_y: 1,
            bit_depth: caps.bit_depth,
        }
    }

    /// Width after binning.
    #[must_use]
    pub fn binned_width(&self) -> u32 {
        self.width / self.bin_x.max(1)
    }

    /// Height after binning.
    #[must_use]
    pub fn binned_height(&self) -> u32 {
        self.height / self.bin_y.max(1)
    }

    /// Bytes needed per pixel (bit depth rounded up to whole bytes).
    #[must_use]
    pub fn bytes_per_pixel(&self) -> usize {
        (self.bit_depth as usize).div_ceil(8)
    }

    /// Bytes of pixel data for one frame.
    pub fn pixel_bytes(&self) -> CameraResult<usize> {
        (self.binned_width() as usize)
            .checked_mul(self.binned_height() as usize)
            .and_then(|px| px.checked_mul(self.bytes_per_pixel()))
            .ok_or_else(|| {
                CameraError::InvalidGeometry(format!(
                    "frame size overflow for {}x{}",
                    self.width, self.height
                ))
            })
    }

    /// Buffer bytes for one frame including `overhead` bytes of trailing
    /// metadata the SDK may append.
    pub fn buffer_bytes(&self, overhead: usize) -> CameraResult<usize> {
        self.pixel_bytes()?
            .checked_add(overhead)
            .ok_or_else(|| CameraError::InvalidGeometry("frame size overflow".into()))
    }

    /// Check the geometry against what the sensor supports.
    pub fn validate(&self, caps: &CameraCapabilities) -> CameraResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(CameraError::InvalidGeometry(
                "width and height must be non-zero".into(),
            ));
        }
        if self.bin_x == 0 || self.bin_y == 0 {
            return Err(CameraError::InvalidGeometry(
                "binning must be at least 1".into(),
            ));
        }
        if (self.bin_x, self.bin_y) != (1, 1) && !caps.can_bin {
            return Err(CameraError::InvalidGeometry(format!(
                "{} does not support binning",
                caps.model
            )));
        }
        if self.bin_x > caps.max_bin_x || self.bin_y > caps.max_bin_y {
            return Err(CameraError::InvalidGeometry(format!(
                "binning {}x{} exceeds maximum {}x{}",
                self.bin_x, self.bin_y, caps.max_bin_x, caps.max_bin_y
            )));
        }
        let right = self.x.checked_add(self.width);
        let bottom = self.y.checked_add(self.height);
        match (right, bottom) {
            (Some(r), Some(b)) if r <= caps.sensor_width && b <= caps.sensor_height => {}
            _ => {
                return Err(CameraError::InvalidGeometry(format!(
                    "region {}x{}+{}+{} exceeds sensor {}x{}",
                    self.width,
                    self.height,
                    self.x,
                    self.y,
                    caps.sensor_width,
                    caps.sensor_height
                )))
            }
        }
        let is_full = self.x == 0
            && self.y == 0
            && self.width == caps.sensor_width
            && self.height == caps.sensor_height;
        if !is_full && !caps.can_subframe {
            return Err(CameraError::InvalidGeometry(format!(
                "{} does not support subframes",
                caps.model
            )));
        }
        if self.binned_width() == 0 || self.binned_height() == 0 {
            return Err(CameraError::InvalidGeometry(
                "binning leaves an empty frame".into(),
            ));
        }
        if self.bit_depth == 0 || self.bit_depth > 32 {
            return Err(CameraError::InvalidGeometry(format!(
                "unsupported bit depth {}",
                self.bit_depth
            )));
        }
        Ok(())
    }
}

/// Kind of frame to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    /// Shutter open, normal science frame.
    #[default]
    Light,
    /// Zero-length readout.
    Bias,
    /// Shutter closed.
    Dark,
    /// Flat field.
    Flat,
}

impl FrameType {
    /// Lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Light => "light",
            FrameType::Bias => "bias",
            FrameType::Dark => "dark",
            FrameType::Flat => "flat",
        }
    }
}

impl std::str::FromStr for FrameType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "light" => Ok(FrameType::Light),
            "bias" => Ok(FrameType::Bias),
            "dark" => Ok(FrameType::Dark),
            "flat" => Ok(FrameType::Flat),
            other => Err(format!(
                "unknown frame type '{}', expected light, bias, dark or flat",
                other
            )),
        }
    }
}
