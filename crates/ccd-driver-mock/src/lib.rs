//! Mock Camera Hardware for rust-ccd
//!
//! This crate provides a simulated camera implementing
//! [`ccd_core::HardwareChannel`], so the exposure and cooler logic can be
//! exercised without a vendor SDK or a camera on the bus.
//!
//! # Modes
//!
//! - [`MockMode::Instant`]: no delays, cooler settles immediately (unit tests)
//! - [`MockMode::Realistic`]: USB readout delay, exponential thermal drift
//! - [`MockMode::Chaos`]: realistic timing plus random failures
//!
//! # Example
//!
//! ```rust
//! use ccd_core::CameraCapabilities;
//! use ccd_driver_mock::{ErrorConfig, ErrorScenario, MockHardware, MockMode};
//!
//! let hw = MockHardware::builder(CameraCapabilities::fishcamp_starfish())
//!     .mode(MockMode::Instant)
//!     .error_config(ErrorConfig::scenario(ErrorScenario::FailFirstN {
//!         operation: "start_capture",
//!         count: 2,
//!     }))
//!     .build();
//! assert_eq!(hw.call_counts().start_capture, 0);
//! ```

pub mod common;
mod mock_hardware;
mod pattern;

// Re-export common types
pub use common::{ErrorConfig, ErrorScenario, MockMode, MockRng, TimingConfig};

pub use mock_hardware::{CallCounts, MockHardware, MockHardwareBuilder, TemperatureSimulation};
pub use pattern::render_star_field;
