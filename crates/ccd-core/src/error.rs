//! Error types for camera drivers.
//!
//! Two layers of errors exist:
//!
//! - **`HardwareError`** is produced at the `HardwareChannel` boundary. Vendor SDKs
//!   report failures as raw integer return codes; those codes are converted into a
//!   `HardwareError` exactly once, inside the channel implementation, so the
//!   exposure and temperature logic never inspects magic return values.
//! - **`CameraError`** is what the driver core returns to its callers. Synchronous
//!   rejections (invalid state, bad geometry, out-of-range setpoint) are returned
//!   directly from the command that caused them; asynchronous failures (start
//!   retries exhausted, readout timeout) surface as the terminal event of the
//!   exposure they belong to.
//!
//! ## Error Hierarchy
//!
//! | Variant | Kind | Transient |
//! |---------|------|-----------|
//! | `HardwareStartFailure` | Hardware | yes (caller may re-request) |
//! | `HardwareReadTimeout` | Timeout | no silent retry |
//! | `HardwareComm` | Communication | yes |
//! | `InvalidStateTransition` | InvalidParameter | no |
//! | `GeometryMismatch` | Configuration | no |
//! | `Config` | Configuration | no |

use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Driver Error Kinds
// =============================================================================

/// Coarse classification of driver failures, used for logging and for deciding
/// whether a caller may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Device open / SDK initialization failed.
    Initialization,
    /// Configuration or geometry is invalid.
    Configuration,
    /// Transport-level failure talking to the device.
    Communication,
    /// Device or driver is shutting down.
    Shutdown,
    /// The device reported a fault.
    Hardware,
    /// An operation did not complete in its time budget.
    Timeout,
    /// A request was rejected because of its arguments or the current state.
    InvalidParameter,
    /// Operation not supported by this camera model.
    Unsupported,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Shutdown => "shutdown",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Unsupported => "unsupported",
        };
        write!(f, "{}", label)
    }
}

// =============================================================================
// Hardware Errors
// =============================================================================

/// Failure reported by a `HardwareChannel` call.
///
/// `code` holds the raw vendor return code when there was one. Simulated
/// hardware and transport errors leave it empty.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} failed: {message}{}", .code.map(|c| format!(" (code {})", c)).unwrap_or_default())]
pub struct HardwareError {
    /// SDK operation that failed (e.g. `"start_capture"`).
    pub operation: &'static str,
    /// Raw vendor return code, if any.
    pub code: Option<i32>,
    /// Human-readable description.
    pub message: String,
}

impl HardwareError {
    /// Create an error without a vendor code.
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            code: None,
            message: message.into(),
        }
    }

    /// Create an error carrying the raw vendor return code.
    pub fn with_code(operation: &'static str, code: i32, message: impl Into<String>) -> Self {
        Self {
            operation,
            code: Some(code),
            message: message.into(),
        }
    }

    /// Convert a "zero means success" return code (Fishcamp convention).
    pub fn check_code(operation: &'static str, code: i32) -> Result<(), HardwareError> {
        match code {
            0 => Ok(()),
            other => Err(Self::with_code(operation, other, "SDK returned an error")),
        }
    }

    /// Convert a "negative means failure" return code (FLI convention).
    ///
    /// Returns the non-negative code on success so callers can use it as a count.
    pub fn check_nonnegative(operation: &'static str, code: i32) -> Result<u32, HardwareError> {
        u32::try_from(code)
            .map_err(|_| Self::with_code(operation, code, "SDK returned a negative status"))
    }
}

/// Result alias for `HardwareChannel` calls.
pub type HwResult<T> = std::result::Result<T, HardwareError>;

// =============================================================================
// Camera Errors
// =============================================================================

/// Convenience alias for results returned by the driver core.
pub type CameraResult<T> = std::result::Result<T, CameraError>;

/// Primary error type returned by the camera driver core.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CameraError {
    /// Hardware refused to start a capture after all retry attempts.
    ///
    /// **Error Type**: Transient. The start sequence already retried locally;
    /// the caller may issue a fresh exposure request.
    #[error("Capture start failed after {attempts} attempts: {source}")]
    HardwareStartFailure {
        /// Number of start attempts made.
        attempts: u32,
        /// The last hardware error observed.
        source: HardwareError,
    },

    /// The hardware did not report the frame ready within the wait budget.
    ///
    /// **Error Type**: Surfaced as a failed exposure. There is no silent retry;
    /// the caller must re-request.
    #[error("Hardware did not report readout ready within {waited:?}")]
    HardwareReadTimeout {
        /// Time spent waiting past the expected end of exposure.
        waited: Duration,
    },

    /// A hardware call failed.
    ///
    /// **Recovery Strategy**: The temperature regulator keeps polling; the
    /// exposure controller terminates the affected exposure.
    #[error("Hardware communication error: {0}")]
    HardwareComm(#[from] HardwareError),

    /// The command is not valid in the current state. No state was changed.
    #[error("Cannot {operation} while exposure is {state}")]
    InvalidStateTransition {
        /// Operation that was rejected.
        operation: &'static str,
        /// State at the time of rejection.
        state: String,
    },

    /// The frame buffer does not match the geometry, or a geometry change was
    /// attempted while a capture is using the buffer.
    #[error("Frame geometry mismatch: {0}")]
    GeometryMismatch(String),

    /// The requested frame geometry is outside what the sensor supports.
    #[error("Invalid frame geometry: {0}")]
    InvalidGeometry(String),

    /// Exposure duration is not a finite positive number within the limit.
    #[error("Invalid exposure duration {0} s")]
    InvalidDuration(f64),

    /// Setpoint outside the cooler's range.
    #[error("Temperature {requested} C outside supported range [{min}, {max}] C")]
    TemperatureOutOfRange {
        /// Requested setpoint.
        requested: f64,
        /// Minimum supported setpoint.
        min: f64,
        /// Maximum supported setpoint.
        max: f64,
    },

    /// An argument is outside what the camera accepts (gain, pulse length).
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The camera model does not support the operation.
    #[error("Operation not supported by this camera: {0}")]
    NotSupported(String),

    /// A readout currently holds the frame buffer.
    #[error("Frame buffer is busy with a readout")]
    BufferBusy,

    /// The device actor has shut down.
    #[error("Device is disconnected")]
    Disconnected,

    /// Configuration failed to load or validate.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CameraError {
    /// Classify the error.
    #[must_use]
    pub fn kind(&self) -> DriverErrorKind {
        match self {
            CameraError::HardwareStartFailure { .. } => DriverErrorKind::Hardware,
            CameraError::HardwareReadTimeout { .. } => DriverErrorKind::Timeout,
            CameraError::HardwareComm(_) => DriverErrorKind::Communication,
            CameraError::InvalidStateTransition { .. }
            | CameraError::InvalidDuration(_)
            | CameraError::TemperatureOutOfRange { .. }
            | CameraError::InvalidParameter(_)
            | CameraError::BufferBusy => DriverErrorKind::InvalidParameter,
            CameraError::GeometryMismatch(_)
            | CameraError::InvalidGeometry(_)
            | CameraError::Config(_) => DriverErrorKind::Configuration,
            CameraError::NotSupported(_) => DriverErrorKind::Unsupported,
            CameraError::Disconnected => DriverErrorKind::Shutdown,
        }
    }

    /// Whether retrying the same request later can succeed without any other change.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CameraError::HardwareStartFailure { .. }
                | CameraError::HardwareComm(_)
                | CameraError::BufferBusy
        )
    }
}

impl From<figment::Error> for CameraError {
    fn from(err: figment::Error) -> Self {
        CameraError::Config(err.to_string())
    }
}
