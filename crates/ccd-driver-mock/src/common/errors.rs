//! Error injection framework for the simulated camera.
//!
//! Failures are produced as [`HardwareError`]s so the driver core sees exactly
//! what a vendor channel would hand it.

use super::rng::MockRng;
use ccd_core::error::HardwareError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Error injection configuration for mock hardware
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Per-operation failure rate (0.0 to 1.0), `"*"` matches every operation
    failure_rates: Arc<HashMap<&'static str, f64>>,
    /// Specific failure scenarios
    scenarios: Arc<Vec<ErrorScenario>>,
    /// RNG for failure decisions
    rng: Arc<MockRng>,
    /// State tracking for scenarios
    state: Arc<Mutex<ErrorState>>,
}

/// A scripted failure.
#[derive(Debug, Clone)]
pub enum ErrorScenario {
    /// Fail after N successful calls of the operation
    FailAfterN {
        /// Operation name (e.g. `"read_frame"`)
        operation: &'static str,
        /// Successful calls before failures start
        count: u32,
    },
    /// Fail the first N calls of the operation, then succeed
    FailFirstN {
        /// Operation name
        operation: &'static str,
        /// Failing calls
        count: u32,
    },
    /// Every call of the operation times out
    Timeout {
        /// Operation name
        operation: &'static str,
    },
    /// USB link drops; every later call fails
    CommunicationLoss,
    /// Camera latches a fault code; every later call fails with it
    HardwareFault {
        /// Vendor fault code
        code: i32,
    },
}

#[derive(Default, Debug)]
struct ErrorState {
    /// Per-operation call counters for the counting scenarios
    operation_counts: HashMap<&'static str, u32>,
    /// Whether communication is lost
    communication_lost: bool,
    /// Latched hardware fault code
    hardware_fault_code: Option<i32>,
}

impl ErrorConfig {
    /// Create error config with no errors (default)
    #[must_use]
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    /// Create error config with uniform random failures and optional seed
    #[must_use]
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*", rate);
        Self::build(rates, Vec::new(), seed)
    }

    /// Create error config with a single scenario
    #[must_use]
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Create error config with multiple scenarios
    #[must_use]
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, None)
    }

    /// Create error config with custom failure rates per operation
    #[must_use]
    pub fn with_rates(rates: HashMap<&'static str, f64>) -> Self {
        Self::build(rates, Vec::new(), None)
    }

    fn build(
        rates: HashMap<&'static str, f64>,
        scenarios: Vec<ErrorScenario>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// Check if an operation should fail and return the error to report
    pub fn check_operation(&self, operation: &'static str) -> Result<(), HardwareError> {
        let mut state = self.state.lock();

        if state.communication_lost {
            return Err(HardwareError::new(operation, "communication lost"));
        }
        if let Some(code) = state.hardware_fault_code {
            return Err(HardwareError::with_code(operation, code, "hardware fault"));
        }

        let counted = self.scenarios.iter().any(|s| {
            matches!(s,
                ErrorScenario::FailAfterN { operation: op, .. }
                | ErrorScenario::FailFirstN { operation: op, .. } if *op == operation)
        });
        let calls = if counted {
            let current = state.operation_counts.entry(operation).or_insert(0);
            *current += 1;
            *current
        } else {
            0
        };

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN {
                    operation: op,
                    count,
                } if *op == operation && calls > *count => {
                    return Err(HardwareError::new(
                        operation,
                        format!("injected failure after {} calls", count),
                    ));
                }
                ErrorScenario::FailFirstN {
                    operation: op,
                    count,
                } if *op == operation && calls <= *count => {
                    return Err(HardwareError::new(
                        operation,
                        format!("injected failure {} of {}", calls, count),
                    ));
                }
                ErrorScenario::Timeout { operation: op } if *op == operation => {
                    return Err(HardwareError::new(operation, "timed out"));
                }
                ErrorScenario::CommunicationLoss => {
                    state.communication_lost = true;
                    return Err(HardwareError::new(operation, "communication lost"));
                }
                ErrorScenario::HardwareFault { code } => {
                    state.hardware_fault_code = Some(*code);
                    return Err(HardwareError::with_code(operation, *code, "hardware fault"));
                }
                _ => {}
            }
        }

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);

        if self.rng.should_fail(rate) {
            return Err(HardwareError::new(operation, "random failure"));
        }

        Ok(())
    }

    /// Reset error state (clear counters, faults)
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_errors() {
        let config = ErrorConfig::none();
        for _ in 0..100 {
            assert!(config.check_operation("read_frame").is_ok());
        }
    }

    #[test]
    fn test_random_failures() {
        let config = ErrorConfig::random_failures_seeded(0.5, Some(42));
        let failures = (0..1000)
            .filter(|_| config.check_operation("poll_ready").is_err())
            .count();
        assert!(failures > 400 && failures < 600, "Got {} failures", failures);
    }

    #[test]
    fn test_fail_after_n() {
        let config = ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "read_frame",
            count: 2,
        });
        assert!(config.check_operation("read_frame").is_ok());
        assert!(config.check_operation("read_frame").is_ok());
        assert!(config.check_operation("read_frame").is_err());
        assert!(config.check_operation("start_capture").is_ok());
    }

    #[test]
    fn test_fail_first_n() {
        let config = ErrorConfig::scenario(ErrorScenario::FailFirstN {
            operation: "start_capture",
            count: 2,
        });
        assert!(config.check_operation("start_capture").is_err());
        assert!(config.check_operation("start_capture").is_err());
        assert!(config.check_operation("start_capture").is_ok());

        config.reset();
        assert!(config.check_operation("start_capture").is_err());
    }

    #[test]
    fn test_latched_faults() {
        let config = ErrorConfig::scenario(ErrorScenario::HardwareFault { code: -5 });
        let err = config.check_operation("temperatures").unwrap_err();
        assert_eq!(err.code, Some(-5));
        assert!(config.check_operation("stop_capture").is_err());

        let config = ErrorConfig::scenario(ErrorScenario::CommunicationLoss);
        assert!(config.check_operation("poll_ready").is_err());
        let err = config.check_operation("read_frame").unwrap_err();
        assert!(err.message.contains("communication lost"));
    }

    #[test]
    fn test_timeout_scenario() {
        let config = ErrorConfig::scenario(ErrorScenario::Timeout {
            operation: "poll_ready",
        });
        let err = config.check_operation("poll_ready").unwrap_err();
        assert!(err.message.contains("timed out"));
        assert!(config.check_operation("read_frame").is_ok());
    }

    #[test]
    fn test_custom_rates() {
        let mut rates = HashMap::new();
        rates.insert("temperatures", 1.0);
        rates.insert("cooler_duty_cycle", 0.0);
        let config = ErrorConfig::with_rates(rates);
        for _ in 0..10 {
            assert!(config.check_operation("temperatures").is_err());
            assert!(config.check_operation("cooler_duty_cycle").is_ok());
        }
    }
}
