//! Device actor: the single scheduling loop for one camera.
//!
//! # Architecture
//!
//! [`CameraDevice`] owns the [`ExposureController`], the
//! [`TemperatureRegulator`] and the current frame settings. It runs as one
//! Tokio task and never shares that state; callers talk to it through a
//! [`CameraHandle`], which sends [`DeviceCommand`]s over an mpsc channel and
//! awaits the reply on a oneshot channel.
//!
//! ```text
//! CameraHandle                      CameraDevice task
//! ------------                      -----------------
//! 1. Build command + oneshot
//! 2. Send via mpsc         ------>  3. select! { command | controller message
//!                                                | exposure tick | cooler poll }
//!                                   4. Apply to controllers, reply
//! 5. Await oneshot         <------
//! ```
//!
//! Device events (progress, completion, temperature, duty) are not replies;
//! they arrive on the [`EventStream`] returned by [`CameraDevice::spawn`].
//!
//! The loop never calls the hardware on its own thread. Commands that touch it
//! (geometry, frame type, gain, cooler setpoint, abort) await the call on the
//! blocking pool before replying; cooler polls and guide pulses run there in
//! the background and report back through a channel or the command's reply.
//!
//! The frame buffer is the only state shared outside the task:
//! [`CameraHandle::latest_frame`] reads it directly and fails with
//! `BufferBusy` while a readout holds the write guard.

use crate::blocking;
use crate::exposure::{ControllerMessage, ExposureController, ExposureState};
use crate::frame_buffer::{FrameBufferManager, FrameSnapshot};
use crate::temperature::{
    CoolerSample, SetTargetOutcome, TemperatureRegulator, TemperatureSetpoint,
};
use ccd_core::capabilities::CameraCapabilities;
use ccd_core::config::DriverConfig;
use ccd_core::error::{CameraError, CameraResult};
use ccd_core::events::{event_channel, CoolerStatus, EventStream};
use ccd_core::geometry::{FrameGeometry, FrameType};
use ccd_core::hardware::{GuideDirection, HardwareChannel};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Capacity of the command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 32;

// =============================================================================
// Commands
// =============================================================================

/// Commands accepted by the device actor.
///
/// Each variant carries a `oneshot::Sender` for the reply. Use the helper
/// constructors, which return the command together with the receiver.
#[derive(Debug)]
pub enum DeviceCommand {
    /// Start an exposure of `duration_s` seconds with the current geometry.
    ///
    /// Replies with the request id once accepted; the outcome arrives as an
    /// `ExposureDone` event.
    RequestExposure {
        /// Integration time in seconds
        duration_s: f64,
        /// Request id or rejection
        response: oneshot::Sender<CameraResult<u64>>,
    },

    /// Abort the exposure in flight.
    AbortExposure {
        /// Acknowledgement or `InvalidStateTransition`
        response: oneshot::Sender<CameraResult<()>>,
    },

    /// Program a new cooler setpoint.
    SetCoolerTarget {
        /// Target, Celsius
        celsius: f64,
        /// Whether regulation started or the target was already reached
        response: oneshot::Sender<CameraResult<SetTargetOutcome>>,
    },

    /// Change readout region and binning.
    ///
    /// Rejected with `GeometryMismatch` while an exposure is active.
    SetGeometry {
        /// New geometry in unbinned sensor pixels
        geometry: FrameGeometry,
        /// Acknowledgement
        response: oneshot::Sender<CameraResult<()>>,
    },

    /// Select light/bias/dark/flat.
    SetFrameType {
        /// Frame type for the next exposures
        frame_type: FrameType,
        /// Acknowledgement
        response: oneshot::Sender<CameraResult<()>>,
    },

    /// Set sensor gain.
    SetGain {
        /// Gain in the camera's native units
        gain: f64,
        /// Acknowledgement
        response: oneshot::Sender<CameraResult<()>>,
    },

    /// Pulse the ST4 guide port.
    ///
    /// The pulse runs on a blocking thread; the reply is sent when it ends.
    PulseGuide {
        /// Direction
        direction: GuideDirection,
        /// Pulse length
        duration: Duration,
        /// Acknowledgement
        response: oneshot::Sender<CameraResult<()>>,
    },

    /// Snapshot of the device state.
    Status {
        /// Current status
        response: oneshot::Sender<DeviceStatus>,
    },

    /// Abort any exposure and stop the actor.
    Disconnect {
        /// Sent once the loop has shut down its controllers
        response: oneshot::Sender<()>,
    },
}

impl DeviceCommand {
    /// Helper to create a RequestExposure command with response channel
    pub fn request_exposure(duration_s: f64) -> (Self, oneshot::Receiver<CameraResult<u64>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::RequestExposure {
                duration_s,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create an AbortExposure command with response channel
    pub fn abort_exposure() -> (Self, oneshot::Receiver<CameraResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::AbortExposure { response: tx }, rx)
    }

    /// Helper to create a SetCoolerTarget command with response channel
    pub fn set_cooler_target(
        celsius: f64,
    ) -> (Self, oneshot::Receiver<CameraResult<SetTargetOutcome>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::SetCoolerTarget {
                celsius,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a SetGeometry command with response channel
    pub fn set_geometry(geometry: FrameGeometry) -> (Self, oneshot::Receiver<CameraResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::SetGeometry {
                geometry,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a SetFrameType command with response channel
    pub fn set_frame_type(frame_type: FrameType) -> (Self, oneshot::Receiver<CameraResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::SetFrameType {
                frame_type,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a SetGain command with response channel
    pub fn set_gain(gain: f64) -> (Self, oneshot::Receiver<CameraResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::SetGain { gain, response: tx }, rx)
    }

    /// Helper to create a PulseGuide command with response channel
    pub fn pulse_guide(
        direction: GuideDirection,
        duration: Duration,
    ) -> (Self, oneshot::Receiver<CameraResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::PulseGuide {
                direction,
                duration,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a Status command with response channel
    pub fn status() -> (Self, oneshot::Receiver<DeviceStatus>) {
        let (tx, rx) = oneshot::channel();
        (Self::Status { response: tx }, rx)
    }

    /// Helper to create a Disconnect command with response channel
    pub fn disconnect() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Disconnect { response: tx }, rx)
    }
}

/// Point-in-time view of a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    /// Camera model
    pub model: String,
    /// Exposure lifecycle state
    pub exposure: ExposureState,
    /// Id of the current or most recent exposure
    pub request_id: Option<u64>,
    /// Active readout geometry
    pub geometry: FrameGeometry,
    /// Active frame type
    pub frame_type: FrameType,
    /// Last gain set, if any
    pub gain: Option<f64>,
    /// Last cooler poll
    pub cooler: CoolerStatus,
    /// Requested cooler setpoint, if any
    pub setpoint: Option<TemperatureSetpoint>,
}

// =============================================================================
// CameraDevice (actor)
// =============================================================================

/// Actor owning one camera's controllers.
pub struct CameraDevice {
    hardware: Arc<dyn HardwareChannel>,
    capabilities: Arc<CameraCapabilities>,
    buffer: FrameBufferManager,
    exposure: ExposureController,
    regulator: TemperatureRegulator,
    messages: mpsc::UnboundedReceiver<ControllerMessage>,
    samples: mpsc::UnboundedReceiver<CoolerSample>,

    geometry: FrameGeometry,
    frame_type: FrameType,
    gain: Option<f64>,
}

impl CameraDevice {
    /// Program full-frame geometry, size the buffer and start the actor task.
    ///
    /// Must be called from within a Tokio runtime. Returns the command handle
    /// and the device's event stream.
    pub fn spawn(
        hardware: Arc<dyn HardwareChannel>,
        capabilities: CameraCapabilities,
        config: &DriverConfig,
    ) -> CameraResult<(CameraHandle, EventStream)> {
        let capabilities = Arc::new(capabilities);
        let geometry = FrameGeometry::full_frame(&capabilities);
        hardware.apply_geometry(&geometry)?;
        let buffer = FrameBufferManager::new(&geometry, config.buffer.overhead_bytes)?;

        let (events_tx, events) = event_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (sample_tx, sample_rx) = mpsc::unbounded_channel();
        let exposure = ExposureController::new(
            Arc::clone(&hardware),
            buffer.clone(),
            config.exposure.clone(),
            events_tx.clone(),
            message_tx,
        );
        let regulator = TemperatureRegulator::new(
            Arc::clone(&hardware),
            Arc::clone(&capabilities),
            config.temperature.clone(),
            events_tx,
            sample_tx,
        );

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let device = Self {
            hardware,
            capabilities: Arc::clone(&capabilities),
            buffer: buffer.clone(),
            exposure,
            regulator,
            messages: message_rx,
            samples: sample_rx,
            geometry,
            frame_type: FrameType::Light,
            gain: None,
        };
        tracing::info!(
            model = %capabilities.model,
            width = geometry.width,
            height = geometry.height,
            "Camera connected"
        );
        tokio::spawn(device.run(command_rx));

        Ok((
            CameraHandle {
                commands: command_tx,
                buffer,
                capabilities,
            },
            events,
        ))
    }

    /// Event loop. Ends on `Disconnect` or when every handle is dropped.
    async fn run(mut self, mut commands: mpsc::Receiver<DeviceCommand>) {
        loop {
            let exposure_deadline = self.exposure.next_deadline().map(Instant::from_std);
            let poll_at = self.regulator.next_poll().map(Instant::from_std);

            tokio::select! {
                command = commands.recv() => match command {
                    Some(DeviceCommand::Disconnect { response }) => {
                        self.shutdown().await;
                        let _ = response.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(message) = self.messages.recv() => {
                    self.exposure.handle_message(message).await;
                }
                Some(sample) = self.samples.recv() => {
                    self.regulator.apply_sample(sample);
                }
                _ = sleep_until_opt(exposure_deadline) => {
                    self.exposure.on_timer();
                }
                _ = sleep_until_opt(poll_at) => {
                    self.regulator.start_poll();
                }
            }
        }
        tracing::info!(model = %self.capabilities.model, "Camera disconnected");
    }

    async fn handle_command(&mut self, command: DeviceCommand) {
        match command {
            DeviceCommand::RequestExposure {
                duration_s,
                response,
            } => {
                let _ = response.send(self.request_exposure(duration_s));
            }
            DeviceCommand::AbortExposure { response } => {
                let _ = response.send(self.exposure.abort_exposure().await);
            }
            DeviceCommand::SetCoolerTarget { celsius, response } => {
                let _ = response.send(self.regulator.set_target(celsius).await);
            }
            DeviceCommand::SetGeometry { geometry, response } => {
                let _ = response.send(self.set_geometry(geometry).await);
            }
            DeviceCommand::SetFrameType {
                frame_type,
                response,
            } => {
                let _ = response.send(self.set_frame_type(frame_type).await);
            }
            DeviceCommand::SetGain { gain, response } => {
                let _ = response.send(self.set_gain(gain).await);
            }
            DeviceCommand::PulseGuide {
                direction,
                duration,
                response,
            } => self.pulse_guide(direction, duration, response),
            DeviceCommand::Status { response } => {
                let _ = response.send(self.status());
            }
            DeviceCommand::Disconnect { response } => {
                // Handled by the loop; reaching here means a shutdown is
                // already under way.
                let _ = response.send(());
            }
        }
    }

    fn request_exposure(&mut self, duration_s: f64) -> CameraResult<u64> {
        self.ensure_idle("start exposure")?;
        let (min, max) = self.capabilities.exposure_range;
        if !(min..=max).contains(&duration_s) {
            return Err(CameraError::InvalidDuration(duration_s));
        }
        self.exposure.request_exposure(duration_s, &self.geometry)
    }

    async fn set_geometry(&mut self, geometry: FrameGeometry) -> CameraResult<()> {
        if self.exposure.state().is_active() {
            return Err(CameraError::GeometryMismatch(format!(
                "cannot change geometry while exposure is {}",
                self.exposure.state().name()
            )));
        }
        geometry.validate(&self.capabilities)?;
        self.buffer.resize(&geometry)?;
        let applied = blocking::call(&self.hardware, "apply_geometry", move |hw| {
            hw.apply_geometry(&geometry)
        })
        .await;
        if let Err(err) = applied {
            tracing::warn!(%err, "Hardware rejected geometry, keeping previous");
            // The buffer is unlocked here; restoring cannot race a readout.
            let _ = self.buffer.resize(&self.geometry);
            return Err(err.into());
        }
        tracing::debug!(?geometry, "Geometry updated");
        self.geometry = geometry;
        Ok(())
    }

    async fn set_frame_type(&mut self, frame_type: FrameType) -> CameraResult<()> {
        self.ensure_idle("set frame type")?;
        if !self.capabilities.supports_frame_type(frame_type) {
            return Err(CameraError::NotSupported(format!(
                "{} frames on {}",
                frame_type.as_str(),
                self.capabilities.model
            )));
        }
        blocking::call(&self.hardware, "set_frame_type", move |hw| {
            hw.set_frame_type(frame_type)
        })
        .await?;
        self.frame_type = frame_type;
        Ok(())
    }

    async fn set_gain(&mut self, gain: f64) -> CameraResult<()> {
        self.ensure_idle("set gain")?;
        let Some((min, max)) = self.capabilities.gain_range else {
            return Err(CameraError::NotSupported(format!(
                "gain control on {}",
                self.capabilities.model
            )));
        };
        if !gain.is_finite() || gain < min || gain > max {
            return Err(CameraError::InvalidParameter(format!(
                "gain {} outside {}..={}",
                gain, min, max
            )));
        }
        blocking::call(&self.hardware, "set_gain", move |hw| hw.set_gain(gain)).await?;
        self.gain = Some(gain);
        Ok(())
    }

    fn pulse_guide(
        &self,
        direction: GuideDirection,
        duration: Duration,
        response: oneshot::Sender<CameraResult<()>>,
    ) {
        if !self.capabilities.has_guide_port {
            let _ = response.send(Err(CameraError::NotSupported(format!(
                "guide port on {}",
                self.capabilities.model
            ))));
            return;
        }
        if duration.is_zero() {
            let _ = response.send(Err(CameraError::InvalidParameter(
                "guide pulse duration must be non-zero".to_string(),
            )));
            return;
        }
        let hardware = Arc::clone(&self.hardware);
        tokio::task::spawn_blocking(move || {
            let result = hardware
                .pulse_guide(direction, duration)
                .map_err(CameraError::from);
            let _ = response.send(result);
        });
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus {
            model: self.capabilities.model.clone(),
            exposure: self.exposure.state().clone(),
            request_id: self.exposure.current_request().map(|r| r.id),
            geometry: self.geometry,
            frame_type: self.frame_type,
            gain: self.gain,
            cooler: self.regulator.status(),
            setpoint: self.regulator.setpoint(),
        }
    }

    fn ensure_idle(&self, operation: &'static str) -> CameraResult<()> {
        if self.exposure.state().is_active() {
            return Err(CameraError::InvalidStateTransition {
                operation,
                state: self.exposure.state().name().to_string(),
            });
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        if self.exposure.state().is_active() {
            if let Err(err) = self.exposure.abort_exposure().await {
                tracing::warn!(%err, "Abort on disconnect failed");
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// CameraHandle
// =============================================================================

/// Cloneable handle to a running [`CameraDevice`].
///
/// Every method fails with `Disconnected` once the actor has stopped.
#[derive(Clone)]
pub struct CameraHandle {
    commands: mpsc::Sender<DeviceCommand>,
    buffer: FrameBufferManager,
    capabilities: Arc<CameraCapabilities>,
}

impl CameraHandle {
    async fn send<T>(&self, (command, rx): (DeviceCommand, oneshot::Receiver<T>)) -> CameraResult<T> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CameraError::Disconnected)?;
        rx.await.map_err(|_| CameraError::Disconnected)
    }

    /// Start an exposure; returns the request id.
    pub async fn request_exposure(&self, duration_s: f64) -> CameraResult<u64> {
        self.send(DeviceCommand::request_exposure(duration_s)).await?
    }

    /// Abort the exposure in flight.
    pub async fn abort_exposure(&self) -> CameraResult<()> {
        self.send(DeviceCommand::abort_exposure()).await?
    }

    /// Program a cooler setpoint.
    pub async fn set_cooler_target(&self, celsius: f64) -> CameraResult<SetTargetOutcome> {
        self.send(DeviceCommand::set_cooler_target(celsius)).await?
    }

    /// Change readout region and binning.
    pub async fn set_geometry(&self, geometry: FrameGeometry) -> CameraResult<()> {
        self.send(DeviceCommand::set_geometry(geometry)).await?
    }

    /// Select the frame type.
    pub async fn set_frame_type(&self, frame_type: FrameType) -> CameraResult<()> {
        self.send(DeviceCommand::set_frame_type(frame_type)).await?
    }

    /// Set sensor gain.
    pub async fn set_gain(&self, gain: f64) -> CameraResult<()> {
        self.send(DeviceCommand::set_gain(gain)).await?
    }

    /// Pulse the guide port; resolves when the pulse ends.
    pub async fn pulse_guide(&self, direction: GuideDirection, duration: Duration) -> CameraResult<()> {
        self.send(DeviceCommand::pulse_guide(direction, duration)).await?
    }

    /// Device status snapshot.
    pub async fn status(&self) -> CameraResult<DeviceStatus> {
        self.send(DeviceCommand::status()).await
    }

    /// Copy of the last completed frame, `None` before the first one.
    ///
    /// Reads the buffer directly; `BufferBusy` while a readout is writing.
    pub fn latest_frame(&self) -> CameraResult<Option<FrameSnapshot>> {
        self.buffer.read_frame()
    }

    /// Abort any exposure and stop the device.
    pub async fn disconnect(&self) -> CameraResult<()> {
        self.send(DeviceCommand::disconnect()).await
    }

    /// Capability record of the camera.
    #[must_use]
    pub fn capabilities(&self) -> &CameraCapabilities {
        &self.capabilities
    }

    /// Whether the actor is still running.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.commands.is_closed()
    }
}

impl std::fmt::Debug for CameraHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraHandle")
            .field("model", &self.capabilities.model)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccd_driver_mock::MockHardware;

    fn spawn_simulator() -> (CameraHandle, EventStream, Arc<MockHardware>) {
        let caps = CameraCapabilities::simulator();
        let hw = Arc::new(MockHardware::new(caps.clone()));
        let (handle, events) =
            CameraDevice::spawn(hw.clone(), caps, &DriverConfig::default()).unwrap();
        (handle, events, hw)
    }

    #[test]
    fn test_command_helpers_return_receivers() {
        let (cmd, _rx) = DeviceCommand::request_exposure(1.5);
        assert!(matches!(cmd, DeviceCommand::RequestExposure { duration_s, .. } if duration_s == 1.5));
        let (cmd, _rx) = DeviceCommand::pulse_guide(GuideDirection::East, Duration::from_millis(20));
        assert!(matches!(
            cmd,
            DeviceCommand::PulseGuide { direction: GuideDirection::East, .. }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawn_programs_full_frame() {
        let (handle, _events, hw) = spawn_simulator();
        assert_eq!(hw.call_counts().apply_geometry, 1);
        let status = handle.status().await.unwrap();
        assert_eq!(status.model, "Simulator");
        assert_eq!(status.geometry, FrameGeometry::full_frame(handle.capabilities()));
        assert_eq!(status.exposure, ExposureState::Idle);
        assert!(handle.latest_frame().unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_frame_type_and_gain_checked_against_capabilities() {
        let (handle, _events, hw) = spawn_simulator();
        handle.set_gain(40.0).await.unwrap();
        assert_eq!(hw.gain(), Some(40.0));
        assert!(matches!(
            handle.set_gain(500.0).await,
            Err(CameraError::InvalidParameter(_))
        ));
        handle.set_frame_type(FrameType::Dark).await.unwrap();
        assert_eq!(hw.frame_type(), FrameType::Dark);

        let caps = CameraCapabilities::fli_kepler("KL400");
        let kepler = Arc::new(MockHardware::new(caps.clone()));
        let (handle, _events) = CameraDevice::spawn(kepler, caps, &DriverConfig::default()).unwrap();
        assert!(matches!(
            handle.set_gain(1.0).await,
            Err(CameraError::NotSupported(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pulse_guide() {
        let (handle, _events, hw) = spawn_simulator();
        handle
            .pulse_guide(GuideDirection::North, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(hw.call_counts().pulse_guide, 1);
        assert!(matches!(
            handle.pulse_guide(GuideDirection::South, Duration::ZERO).await,
            Err(CameraError::InvalidParameter(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_exposure_outside_capability_range() {
        let (handle, _events, _hw) = spawn_simulator();
        assert!(matches!(
            handle.request_exposure(0.00001).await,
            Err(CameraError::InvalidDuration(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_busy_device_rejects_any_second_request_as_state_error() {
        let (handle, _events, _hw) = spawn_simulator();
        handle.request_exposure(2.0).await.unwrap();
        for duration in [1.0, 0.00001, 1e9] {
            assert!(matches!(
                handle.request_exposure(duration).await,
                Err(CameraError::InvalidStateTransition { .. })
            ));
        }
        handle.abort_exposure().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_commands_after_disconnect_fail() {
        let (handle, _events, _hw) = spawn_simulator();
        let clone = handle.clone();
        clone.disconnect().await.unwrap();
        assert!(matches!(handle.status().await, Err(CameraError::Disconnected)));
    }
}
