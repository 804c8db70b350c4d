//! Driver configuration using Figment
//!
//! Configuration is layered:
//! 1. Built-in defaults (the tuning constants of the Fishcamp and Kepler drivers)
//! 2. A TOML file (usually `config/ccd.toml`)
//! 3. Environment variables prefixed with `CCD_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use ccd_core::config::DriverConfig;
//!
//! let config = DriverConfig::load_from("config/ccd.toml")?;
//! config.validate()?;
//! println!("Device: {}", config.device.model);
//! # Ok::<(), ccd_core::error::CameraError>(())
//! ```
//!
//! Environment override example: `CCD_TEMPERATURE__TOLERANCE_C=0.5`.

use crate::error::{CameraError, CameraResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level driver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DriverConfig {
    /// Which camera to drive
    pub device: DeviceConfig,
    /// Exposure state machine tuning
    pub exposure: ExposureConfig,
    /// Cooler regulation tuning
    pub temperature: TemperatureConfig,
    /// Frame buffer sizing
    pub buffer: BufferConfig,
    /// Log output
    pub logging: LoggingConfig,
}

/// Device selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Capability model string, e.g. `fishcamp`, `fli-kepler:KL4040`, `simulator`
    pub model: String,
    /// Mock behaviour when running against simulated hardware (instant, realistic, chaos)
    pub simulation: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            model: "simulator".to_string(),
            simulation: "realistic".to_string(),
        }
    }
}

/// Exposure lifecycle tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureConfig {
    /// Hardware start attempts before the exposure fails
    pub start_attempts: u32,
    /// Delay between start attempts
    pub start_retry_delay_ms: u64,
    /// Exposures at least this long (s) emit per-second progress events
    pub progress_threshold_s: f64,
    /// Exposures longer than this (s) are logged at info level
    pub verbose_threshold_s: f64,
    /// Below 1 s remaining, tick at the medium interval while above this (s)
    pub medium_threshold_s: f64,
    /// Tick at the fine interval while above this (s); below it, final approach
    pub fine_threshold_s: f64,
    /// Medium tick interval
    pub medium_interval_ms: u64,
    /// Fine tick interval
    pub fine_interval_ms: u64,
    /// How long past the expected end to wait for the hardware to report ready
    pub readout_timeout_ms: u64,
    /// Longest accepted exposure (s)
    pub max_duration_s: f64,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            start_attempts: 3,
            start_retry_delay_ms: 100,
            progress_threshold_s: 1.0,
            verbose_threshold_s: 3.0,
            medium_threshold_s: 0.25,
            fine_threshold_s: 0.07,
            medium_interval_ms: 250,
            fine_interval_ms: 50,
            readout_timeout_ms: 10_000,
            max_duration_s: 3600.0,
        }
    }
}

impl ExposureConfig {
    /// Delay between start attempts.
    #[must_use]
    pub fn start_retry_delay(&self) -> Duration {
        Duration::from_millis(self.start_retry_delay_ms)
    }

    /// Medium tick interval.
    #[must_use]
    pub fn medium_interval(&self) -> Duration {
        Duration::from_millis(self.medium_interval_ms)
    }

    /// Fine tick interval.
    #[must_use]
    pub fn fine_interval(&self) -> Duration {
        Duration::from_millis(self.fine_interval_ms)
    }

    /// Ready-wait budget past the expected end of exposure.
    #[must_use]
    pub fn readout_timeout(&self) -> Duration {
        Duration::from_millis(self.readout_timeout_ms)
    }
}

/// Cooler regulation tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemperatureConfig {
    /// |target - current| at or below this counts as at target (C)
    pub tolerance_c: f64,
    /// Readings are reported when they move more than this (C)
    pub report_threshold_c: f64,
    /// Poll interval while driving toward a setpoint
    pub busy_interval_ms: u64,
    /// Poll interval otherwise
    pub idle_interval_ms: u64,
    /// Duty cycle is reported when it moves at least this many percentage points
    pub duty_threshold_percent: f64,
}

impl Default for TemperatureConfig {
    fn default() -> Self {
        Self {
            tolerance_c: 0.1,
            report_threshold_c: 0.1,
            busy_interval_ms: 1000,
            idle_interval_ms: 5000,
            duty_threshold_percent: 1.0,
        }
    }
}

impl TemperatureConfig {
    /// Poll interval while Busy.
    #[must_use]
    pub fn busy_interval(&self) -> Duration {
        Duration::from_millis(self.busy_interval_ms)
    }

    /// Poll interval otherwise.
    #[must_use]
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }
}

/// Frame buffer sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Extra bytes reserved after the pixel data
    pub overhead_bytes: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            overhead_bytes: 512,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (pretty, compact, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl DriverConfig {
    /// Load defaults overlaid with `CCD_` environment variables only.
    pub fn load() -> CameraResult<Self> {
        Ok(Self::defaults()
            .merge(Env::prefixed("CCD_").split("__"))
            .extract()?)
    }

    /// Load from a TOML file, then apply `CCD_` environment overrides.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> CameraResult<Self> {
        Ok(Self::defaults()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CCD_").split("__"))
            .extract()?)
    }

    fn defaults() -> Figment {
        Figment::from(Serialized::defaults(DriverConfig::default()))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> CameraResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(CameraError::Config(format!(
                "Invalid logging level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(CameraError::Config(format!(
                "Invalid logging format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            )));
        }

        let valid_modes = ["instant", "realistic", "chaos"];
        if !valid_modes.contains(&self.device.simulation.as_str()) {
            return Err(CameraError::Config(format!(
                "Invalid simulation mode '{}'. Must be one of: {}",
                self.device.simulation,
                valid_modes.join(", ")
            )));
        }

        let exposure = &self.exposure;
        if exposure.start_attempts == 0 {
            return Err(CameraError::Config(
                "exposure.start_attempts must be at least 1".into(),
            ));
        }
        if !(exposure.max_duration_s.is_finite() && exposure.max_duration_s > 0.0) {
            return Err(CameraError::Config(format!(
                "exposure.max_duration_s must be positive, got {}",
                exposure.max_duration_s
            )));
        }
        if !(exposure.fine_threshold_s >= 0.0
            && exposure.fine_threshold_s < exposure.medium_threshold_s
            && exposure.medium_threshold_s < 1.0)
        {
            return Err(CameraError::Config(format!(
                "exposure thresholds must satisfy 0 <= fine ({}) < medium ({}) < 1",
                exposure.fine_threshold_s, exposure.medium_threshold_s
            )));
        }
        if exposure.medium_interval_ms == 0 || exposure.fine_interval_ms == 0 {
            return Err(CameraError::Config(
                "exposure tick intervals must be non-zero".into(),
            ));
        }

        let temperature = &self.temperature;
        if temperature.tolerance_c < 0.0 || temperature.report_threshold_c < 0.0 {
            return Err(CameraError::Config(
                "temperature tolerance and report threshold must be non-negative".into(),
            ));
        }
        if temperature.busy_interval_ms == 0 || temperature.idle_interval_ms == 0 {
            return Err(CameraError::Config(
                "temperature poll intervals must be non-zero".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_driver_constants() {
        let config = DriverConfig::default();
        assert_eq!(config.exposure.start_attempts, 3);
        assert_eq!(config.exposure.start_retry_delay(), Duration::from_millis(100));
        assert_eq!(config.temperature.tolerance_c, 0.1);
        assert_eq!(config.temperature.idle_interval(), Duration::from_secs(5));
        assert_eq!(config.buffer.overhead_bytes, 512);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = DriverConfig::default();
        config.logging.level = "verbose".into();
        assert!(config.validate().is_err());

        let mut config = DriverConfig::default();
        config.exposure.start_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = DriverConfig::default();
        config.exposure.fine_threshold_s = 0.5;
        assert!(config.validate().is_err());

        let mut config = DriverConfig::default();
        config.temperature.busy_interval_ms = 0;
        assert!(config.validate().is_err());
    }
}
