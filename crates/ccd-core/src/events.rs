//! Device notifications.
//!
//! The driver core reports everything that happens asynchronously through a
//! single stream of [`DeviceEvent`]s. Each event is emitted at most once per
//! logical transition:
//!
//! - `ExposureProgress` once per whole second of countdown (long exposures only)
//! - `ExposureDone` exactly once per accepted exposure request
//! - `TemperatureReading` when the reading moves past the report threshold or
//!   the regulation state changes
//! - `CoolerDuty` when the duty cycle moves by at least the duty threshold
//!
//! The channel is unbounded so that emitting never blocks, including from the
//! blocking readout thread.

use crate::error::CameraError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Why an exposure failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The hardware refused to start after all retries.
    StartFailure(String),
    /// The hardware never reported the frame ready.
    Timeout,
    /// A hardware call failed while waiting or reading back.
    Hardware(String),
    /// The readout returned no data.
    EmptyReadout,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::StartFailure(msg) => write!(f, "start failure: {}", msg),
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::Hardware(msg) => write!(f, "hardware error: {}", msg),
            FailureReason::EmptyReadout => write!(f, "empty readout"),
        }
    }
}

impl From<&CameraError> for FailureReason {
    fn from(err: &CameraError) -> Self {
        match err {
            CameraError::HardwareStartFailure { .. } => {
                FailureReason::StartFailure(err.to_string())
            }
            CameraError::HardwareReadTimeout { .. } => FailureReason::Timeout,
            other => FailureReason::Hardware(other.to_string()),
        }
    }
}

/// Terminal result of an exposure request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExposureOutcome {
    /// Frame read into the buffer.
    Complete,
    /// Exposure ended with an error.
    Failed(FailureReason),
    /// Exposure aborted by the caller or by disconnect.
    Aborted,
}

/// Temperature regulation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RegulationState {
    /// No setpoint requested yet.
    #[default]
    Idle,
    /// Setpoint reached (within tolerance).
    Ok,
    /// Cooling or warming toward the setpoint.
    Busy,
    /// Hardware error reading or commanding the cooler.
    Alert,
}

impl fmt::Display for RegulationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RegulationState::Idle => "idle",
            RegulationState::Ok => "ok",
            RegulationState::Busy => "busy",
            RegulationState::Alert => "alert",
        };
        write!(f, "{}", label)
    }
}

/// Cooler snapshot produced on every regulator poll.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CoolerStatus {
    /// Last sensor temperature read, Celsius.
    pub current_temp: Option<f64>,
    /// Last duty cycle read, percent.
    pub duty_cycle_percent: Option<f64>,
    /// Regulation state.
    pub state: RegulationState,
}

/// Asynchronous notification from a camera device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceEvent {
    /// Countdown of a long exposure, rounded to whole seconds.
    ExposureProgress {
        /// Seconds left.
        remaining_s: f64,
    },
    /// Terminal notification of an exposure request.
    ExposureDone {
        /// How the exposure ended.
        outcome: ExposureOutcome,
        /// Bytes read into the frame buffer (0 unless complete).
        byte_count: usize,
    },
    /// Sensor temperature update.
    TemperatureReading {
        /// Sensor temperature, Celsius.
        celsius: f64,
        /// Regulation state at the time of the reading.
        state: RegulationState,
    },
    /// Cooler power update.
    CoolerDuty {
        /// Percent of full cooling power.
        percent: f64,
    },
}

impl DeviceEvent {
    /// For `ExposureDone`, whether the exposure completed successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            DeviceEvent::ExposureDone {
                outcome: ExposureOutcome::Complete,
                ..
            }
        )
    }

    /// Whether this is the terminal notification of an exposure.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeviceEvent::ExposureDone { .. })
    }
}

/// Sending half of the device event stream.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<DeviceEvent>,
}

impl EventSink {
    /// Emit an event. Dropped silently when nobody listens.
    pub fn emit(&self, event: DeviceEvent) {
        tracing::trace!(?event, "Device event");
        if self.tx.send(event).is_err() {
            tracing::debug!("Event stream closed, dropping event");
        }
    }
}

/// Receiving half of the device event stream.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<DeviceEvent>,
}

impl EventStream {
    /// Wait for the next event. `None` once every sink is dropped.
    pub async fn recv(&mut self) -> Option<DeviceEvent> {
        self.rx.recv().await
    }

    /// Take the next event if one is queued.
    pub fn try_recv(&mut self) -> Option<DeviceEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain every queued event.
    pub fn drain(&mut self) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Create a connected sink / stream pair.
#[must_use]
pub fn event_channel() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, EventStream { rx })
}
