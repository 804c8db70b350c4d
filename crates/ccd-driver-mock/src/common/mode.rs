//! Operational modes for the simulated camera.
//!
//! - **Instant**: No delays, cooler reaches its setpoint immediately. For unit tests.
//! - **Realistic**: Readout and communication delays, exponential thermal drift.
//! - **Chaos**: Realistic timing plus random failures on every operation.

use std::str::FromStr;

/// Operational modes for mock hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockMode {
    /// Zero delays, deterministic - for unit tests
    #[default]
    Instant,
    /// Hardware-like timing - for integration tests and the demo daemon
    Realistic,
    /// Random failures - for resilience testing
    Chaos,
}

impl MockMode {
    /// Whether calls should sleep to imitate the hardware.
    #[must_use]
    pub fn simulates_delays(&self) -> bool {
        !matches!(self, MockMode::Instant)
    }
}

impl FromStr for MockMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "instant" => Ok(MockMode::Instant),
            "realistic" => Ok(MockMode::Realistic),
            "chaos" => Ok(MockMode::Chaos),
            other => Err(format!("unknown mock mode '{}'", other)),
        }
    }
}
