//! Cooler regulation loop.
//!
//! The regulator polls the camera on its own schedule: every `busy_interval`
//! while driving toward a new setpoint, every `idle_interval` otherwise. Each
//! poll reads the sensor temperature and the cooler duty cycle on the blocking
//! pool ([`TemperatureRegulator::start_poll`]) and hands the readings back as a
//! [`CoolerSample`]. Applying the sample updates the regulation state and
//! reports changes with hysteresis:
//!
//! - a `TemperatureReading` when the reading moved more than the report
//!   threshold since the last report, or when the regulation state changed
//! - a `CoolerDuty` when the duty cycle moved at least the duty threshold
//!
//! A failed read sets `Alert` and is reported once; later polls keep trying
//! and the first good reading leaves `Alert` again.

use crate::blocking;
use ccd_core::capabilities::CameraCapabilities;
use ccd_core::config::TemperatureConfig;
use ccd_core::error::{CameraError, CameraResult, HwResult};
use ccd_core::events::{CoolerStatus, DeviceEvent, EventSink, RegulationState};
use ccd_core::hardware::{HardwareChannel, TemperatureSample};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Requested cooler temperature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemperatureSetpoint {
    /// Target, Celsius.
    pub target: f64,
    /// Readings within this distance of the target count as reached.
    pub tolerance: f64,
}

impl TemperatureSetpoint {
    /// Whether `celsius` is within tolerance of the target.
    #[must_use]
    pub fn is_reached(&self, celsius: f64) -> bool {
        (self.target - celsius).abs() <= self.tolerance
    }
}

/// Result of an accepted setpoint request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SetTargetOutcome {
    /// Current reading already within tolerance; the hardware was not touched.
    AlreadyAtTarget,
    /// Setpoint programmed; regulation in progress.
    Regulating,
}

/// Readings taken by one poll.
#[derive(Debug)]
pub struct CoolerSample {
    temperature: HwResult<TemperatureSample>,
    /// `None` on cameras without a cooler.
    duty: Option<HwResult<f64>>,
}

impl CoolerSample {
    /// Read the temperatures and, with a cooler, its duty cycle.
    ///
    /// Blocks on the hardware.
    pub fn read(hardware: &dyn HardwareChannel, has_cooler: bool) -> Self {
        Self {
            temperature: hardware.temperatures(),
            duty: has_cooler.then(|| hardware.cooler_duty_cycle()),
        }
    }
}

/// Owns the cooler state of one camera.
pub struct TemperatureRegulator {
    hardware: Arc<dyn HardwareChannel>,
    capabilities: Arc<CameraCapabilities>,
    config: TemperatureConfig,
    events: EventSink,
    samples: mpsc::UnboundedSender<CoolerSample>,

    setpoint: Option<TemperatureSetpoint>,
    state: RegulationState,
    current: Option<f64>,
    duty: Option<f64>,
    last_reported_temp: Option<f64>,
    last_reported_state: Option<RegulationState>,
    last_reported_duty: Option<f64>,
    /// `None` while a poll is in flight.
    next_poll: Option<Instant>,
}

impl TemperatureRegulator {
    /// Create a regulator. The first poll is due immediately.
    ///
    /// `samples` is the sending half of the channel the device actor feeds
    /// back into [`apply_sample`](Self::apply_sample).
    pub fn new(
        hardware: Arc<dyn HardwareChannel>,
        capabilities: Arc<CameraCapabilities>,
        config: TemperatureConfig,
        events: EventSink,
        samples: mpsc::UnboundedSender<CoolerSample>,
    ) -> Self {
        Self {
            hardware,
            capabilities,
            config,
            events,
            samples,
            setpoint: None,
            state: RegulationState::Idle,
            current: None,
            duty: None,
            last_reported_temp: None,
            last_reported_state: None,
            last_reported_duty: None,
            next_poll: Some(Instant::now()),
        }
    }

    /// When the next poll is due; `None` while one is running.
    #[must_use]
    pub fn next_poll(&self) -> Option<Instant> {
        self.next_poll
    }

    /// Current setpoint, if one was requested.
    #[must_use]
    pub fn setpoint(&self) -> Option<TemperatureSetpoint> {
        self.setpoint
    }

    /// Snapshot of the last readings and the regulation state.
    #[must_use]
    pub fn status(&self) -> CoolerStatus {
        CoolerStatus {
            current_temp: self.current,
            duty_cycle_percent: self.duty,
            state: self.state,
        }
    }

    /// Request a new cooler temperature.
    pub async fn set_target(&mut self, target: f64) -> CameraResult<SetTargetOutcome> {
        if !self.capabilities.has_cooler {
            return Err(CameraError::NotSupported(format!(
                "{} has no cooler",
                self.capabilities.model
            )));
        }
        if !self.capabilities.temperature_in_range(target) {
            let (min, max) = self.capabilities.temperature_range;
            return Err(CameraError::TemperatureOutOfRange {
                requested: target,
                min,
                max,
            });
        }

        let setpoint = TemperatureSetpoint {
            target,
            tolerance: self.config.tolerance_c,
        };
        if self.current.is_some_and(|c| setpoint.is_reached(c)) {
            tracing::debug!(target, "Already at temperature target");
            self.setpoint = Some(setpoint);
            if self.state != RegulationState::Alert {
                self.state = RegulationState::Ok;
            }
            self.report_temperature(false);
            return Ok(SetTargetOutcome::AlreadyAtTarget);
        }

        let result = blocking::call(&self.hardware, "set_temperature_target", move |hw| {
            hw.set_temperature_target(target)
        })
        .await;
        match result {
            Ok(()) => {
                tracing::info!(target, "Setting CCD temperature");
                self.setpoint = Some(setpoint);
                self.state = RegulationState::Busy;
                if self.next_poll.is_some() {
                    self.next_poll = Some(Instant::now() + self.config.busy_interval());
                }
                self.report_temperature(false);
                Ok(SetTargetOutcome::Regulating)
            }
            Err(err) => {
                tracing::error!(target, %err, "Failed to set temperature");
                self.state = RegulationState::Alert;
                self.report_temperature(false);
                Err(err.into())
            }
        }
    }

    /// Read the hardware on the blocking pool.
    ///
    /// The readings arrive on the sample channel; no further poll is
    /// scheduled until they are applied.
    pub fn start_poll(&mut self) {
        self.next_poll = None;
        let hardware = Arc::clone(&self.hardware);
        let has_cooler = self.capabilities.has_cooler;
        let samples = self.samples.clone();
        tokio::task::spawn_blocking(move || {
            let _ = samples.send(CoolerSample::read(hardware.as_ref(), has_cooler));
        });
    }

    /// Apply one poll's readings and schedule the next poll.
    pub fn apply_sample(&mut self, sample: CoolerSample) -> CoolerStatus {
        match sample.temperature {
            Ok(reading) => {
                let celsius = reading.cooler;
                self.current = Some(celsius);
                if self.state == RegulationState::Alert {
                    tracing::info!(celsius, "Temperature readout recovered");
                    self.state = match self.setpoint {
                        Some(sp) if sp.is_reached(celsius) => RegulationState::Ok,
                        Some(_) => RegulationState::Busy,
                        None => RegulationState::Idle,
                    };
                }
                if self.state == RegulationState::Busy
                    && self.setpoint.is_some_and(|sp| sp.is_reached(celsius))
                {
                    tracing::info!(celsius, "Temperature target reached");
                    self.state = RegulationState::Ok;
                }
                self.report_temperature(true);
            }
            Err(err) => {
                if self.state != RegulationState::Alert {
                    tracing::warn!(%err, "Temperature read failed");
                    self.state = RegulationState::Alert;
                    self.report_temperature(false);
                }
            }
        }

        if let Some(duty) = sample.duty {
            self.apply_duty_cycle(duty);
        }

        let interval = match self.state {
            RegulationState::Busy => self.config.busy_interval(),
            _ => self.config.idle_interval(),
        };
        self.next_poll = Some(Instant::now() + interval);
        self.status()
    }

    fn apply_duty_cycle(&mut self, duty: HwResult<f64>) {
        match duty {
            Ok(percent) => {
                self.duty = Some(percent);
                let moved = self
                    .last_reported_duty
                    .map_or(true, |last| (percent - last).abs() >= self.config.duty_threshold_percent);
                if moved {
                    self.last_reported_duty = Some(percent);
                    self.events.emit(DeviceEvent::CoolerDuty { percent });
                }
            }
            Err(err) => tracing::debug!(%err, "Cooler duty read failed"),
        }
    }

    /// Emit a reading if the state changed, or (when `check_delta`) if the
    /// temperature moved past the report threshold.
    fn report_temperature(&mut self, check_delta: bool) {
        let state_changed = self.last_reported_state != Some(self.state);
        let moved = check_delta
            && match (self.current, self.last_reported_temp) {
                (Some(current), Some(last)) => {
                    (current - last).abs() > self.config.report_threshold_c
                }
                (Some(_), None) => true,
                _ => false,
            };
        if !state_changed && !moved {
            return;
        }
        self.last_reported_state = Some(self.state);
        if let Some(current) = self.current {
            self.last_reported_temp = Some(current);
        }
        self.events.emit(DeviceEvent::TemperatureReading {
            celsius: self.current.unwrap_or(f64::NAN),
            state: self.state,
        });
    }
}

impl std::fmt::Debug for TemperatureRegulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemperatureRegulator")
            .field("setpoint", &self.setpoint)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccd_core::events::{event_channel, EventStream};
    use ccd_driver_mock::MockHardware;

    struct Rig {
        reg: TemperatureRegulator,
        hw: Arc<MockHardware>,
        events: EventStream,
        samples: mpsc::UnboundedReceiver<CoolerSample>,
    }

    impl Rig {
        fn new(caps: CameraCapabilities) -> Self {
            let hw = Arc::new(MockHardware::new(caps.clone()));
            let (sink, events) = event_channel();
            let (tx, samples) = mpsc::unbounded_channel();
            let reg = TemperatureRegulator::new(
                hw.clone(),
                Arc::new(caps),
                TemperatureConfig::default(),
                sink,
                tx,
            );
            Self {
                reg,
                hw,
                events,
                samples,
            }
        }

        /// One full poll, the way the device actor runs it.
        async fn poll(&mut self) {
            self.reg.start_poll();
            let sample = self.samples.recv().await.unwrap();
            self.reg.apply_sample(sample);
        }

        fn readings(&mut self) -> Vec<(f64, RegulationState)> {
            self.events
                .drain()
                .into_iter()
                .filter_map(|e| match e {
                    DeviceEvent::TemperatureReading { celsius, state } => Some((celsius, state)),
                    _ => None,
                })
                .collect()
        }

        fn duties(&mut self) -> Vec<f64> {
            self.events
                .drain()
                .into_iter()
                .filter_map(|e| match e {
                    DeviceEvent::CoolerDuty { percent } => Some(percent),
                    _ => None,
                })
                .collect()
        }
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_and_missing_cooler() {
        let mut rig = Rig::new(CameraCapabilities::fli_kepler("KL4040"));
        assert!(matches!(
            rig.reg.set_target(-45.0).await,
            Err(CameraError::TemperatureOutOfRange { min, .. }) if min == -40.0
        ));

        let caps = CameraCapabilities {
            has_cooler: false,
            ..CameraCapabilities::simulator()
        };
        let mut rig2 = Rig::new(caps);
        assert!(matches!(
            rig2.reg.set_target(0.0).await,
            Err(CameraError::NotSupported(_))
        ));
        assert_eq!(rig.hw.call_counts().set_temperature_target, 0);
    }

    #[tokio::test]
    async fn test_repeated_target_calls_hardware_once() {
        let mut rig = Rig::new(CameraCapabilities::simulator());
        rig.poll().await;
        assert_eq!(
            rig.reg.set_target(-10.0).await.unwrap(),
            SetTargetOutcome::Regulating
        );
        assert_eq!(rig.reg.status().state, RegulationState::Busy);
        assert_eq!(rig.hw.call_counts().set_temperature_target, 1);

        // Instant mock settles at the setpoint on the next read.
        rig.poll().await;
        assert_eq!(rig.reg.status().state, RegulationState::Ok);
        for _ in 0..3 {
            assert_eq!(
                rig.reg.set_target(-10.0).await.unwrap(),
                SetTargetOutcome::AlreadyAtTarget
            );
        }
        assert_eq!(rig.hw.call_counts().set_temperature_target, 1);
    }

    #[tokio::test]
    async fn test_busy_until_within_tolerance() {
        let mut rig = Rig::new(CameraCapabilities::simulator());
        rig.hw.script_temperatures([20.0, 5.0, -9.95]);
        rig.poll().await;
        rig.reg.set_target(-10.0).await.unwrap();
        let busy_poll = rig.reg.next_poll();

        rig.poll().await;
        assert_eq!(rig.reg.status().state, RegulationState::Busy);
        assert!(rig.reg.next_poll() > busy_poll);

        rig.poll().await;
        assert_eq!(rig.reg.status().state, RegulationState::Ok);
        let states: Vec<RegulationState> = rig.readings().into_iter().map(|r| r.1).collect();
        assert_eq!(
            states,
            vec![
                RegulationState::Idle,
                RegulationState::Busy,
                RegulationState::Busy,
                RegulationState::Ok
            ]
        );
    }

    #[tokio::test]
    async fn test_no_poll_scheduled_while_one_is_running() {
        let mut rig = Rig::new(CameraCapabilities::simulator());
        assert!(rig.reg.next_poll().is_some());

        rig.reg.start_poll();
        assert!(rig.reg.next_poll().is_none());
        // A setpoint accepted mid-poll does not schedule a second one.
        rig.reg.set_target(-5.0).await.unwrap();
        assert!(rig.reg.next_poll().is_none());

        let sample = rig.samples.recv().await.unwrap();
        rig.reg.apply_sample(sample);
        assert!(rig.reg.next_poll().is_some());
    }

    #[tokio::test]
    async fn test_readings_reported_past_threshold() {
        let mut rig = Rig::new(CameraCapabilities::simulator());
        rig.hw.script_temperatures([10.0, 10.05, 10.2, 10.25]);
        for _ in 0..4 {
            rig.poll().await;
        }
        let temps: Vec<f64> = rig.readings().into_iter().map(|r| r.0).collect();
        assert_eq!(temps, vec![10.0, 10.2]);
    }

    #[tokio::test]
    async fn test_duty_cycle_hysteresis() {
        let mut rig = Rig::new(CameraCapabilities::simulator());
        rig.hw.script_duty_cycle([42.0, 42.5, 44.0]);
        for _ in 0..3 {
            rig.poll().await;
        }
        assert_eq!(rig.duties(), vec![42.0, 44.0]);
        assert_eq!(rig.reg.status().duty_cycle_percent, Some(44.0));
    }

    #[tokio::test]
    async fn test_read_error_reported_once_then_recovers() {
        let mut rig = Rig::new(CameraCapabilities::simulator());
        rig.poll().await;
        rig.readings();

        rig.hw.set_failing("temperatures", true);
        for _ in 0..3 {
            rig.poll().await;
        }
        let alerts = rig.readings();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0], (20.0, RegulationState::Alert));

        rig.hw.set_failing("temperatures", false);
        rig.poll().await;
        assert_eq!(rig.reg.status().state, RegulationState::Idle);
        assert_eq!(rig.readings(), vec![(20.0, RegulationState::Idle)]);
    }

    #[tokio::test]
    async fn test_hardware_failure_on_set_is_alert() {
        let mut rig = Rig::new(CameraCapabilities::simulator());
        rig.poll().await;
        rig.hw.set_failing("set_temperature_target", true);
        assert!(matches!(
            rig.reg.set_target(-20.0).await,
            Err(CameraError::HardwareComm(_))
        ));
        assert_eq!(rig.reg.status().state, RegulationState::Alert);
        assert_eq!(
            rig.readings().last().map(|r| r.1),
            Some(RegulationState::Alert)
        );
    }
}
