//! Timing configuration for realistic mode.

use std::time::Duration;

/// Hardware-like delays of a USB CCD camera
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingConfig {
    /// Time `read_frame` takes to transfer a frame
    pub frame_readout_ms: u64,
    /// Round-trip time of a short command (start, stop, temperature read)
    pub communication_delay_ms: u64,
    /// Extra time after the integration ends before the sensor reports ready
    pub ready_latency_ms: u64,
}

impl TimingConfig {
    /// Timing of a Fishcamp Starfish over USB 2.0 (full frame ~1.3 MB)
    #[must_use]
    pub fn ccd() -> Self {
        Self {
            frame_readout_ms: 120,
            communication_delay_ms: 2,
            ready_latency_ms: 5,
        }
    }

    pub(crate) fn readout(&self) -> Duration {
        Duration::from_millis(self.frame_readout_ms)
    }

    pub(crate) fn communication(&self) -> Duration {
        Duration::from_millis(self.communication_delay_ms)
    }

    pub(crate) fn ready_latency(&self) -> Duration {
        Duration::from_millis(self.ready_latency_ms)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            frame_readout_ms: 0,
            communication_delay_ms: 0,
            ready_latency_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timing() {
        let config = TimingConfig::default();
        assert_eq!(config.readout(), Duration::ZERO);
        assert_eq!(config.communication(), Duration::ZERO);
    }

    #[test]
    fn test_ccd_timing() {
        let config = TimingConfig::ccd();
        assert_eq!(config.frame_readout_ms, 120);
        assert_eq!(config.ready_latency(), Duration::from_millis(5));
    }
}
