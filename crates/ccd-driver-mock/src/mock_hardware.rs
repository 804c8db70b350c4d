//! Simulated single-exposure CCD camera.

use crate::common::{ErrorConfig, MockMode, MockRng, TimingConfig};
use crate::pattern::render_star_field;
use ccd_core::capabilities::CameraCapabilities;
use ccd_core::config::DriverConfig;
use ccd_core::error::{HardwareError, HwResult};
use ccd_core::geometry::{FrameGeometry, FrameType};
use ccd_core::hardware::{GuideDirection, HardwareChannel, TemperatureSample};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Failure rate applied to every operation in chaos mode.
const CHAOS_FAILURE_RATE: f64 = 0.05;

// =============================================================================
// TemperatureSimulation - Thermal Behavior
// =============================================================================

/// Sensor temperature with exponential drift toward the setpoint.
#[derive(Debug, Clone)]
pub struct TemperatureSimulation {
    ambient: f64,
    current: f64,
    setpoint: Option<f64>,
    /// Fraction of the remaining difference closed per second
    drift_rate: f64,
    /// Lowest reachable temperature (TEC delta below ambient)
    floor: f64,
}

impl TemperatureSimulation {
    fn new(ambient: f64, cooler_min: f64) -> Self {
        Self {
            ambient,
            current: ambient,
            setpoint: None,
            drift_rate: 0.1,
            floor: cooler_min.max(ambient - 45.0),
        }
    }

    fn set_setpoint(&mut self, setpoint: f64) {
        self.setpoint = Some(setpoint);
    }

    fn target(&self) -> f64 {
        self.setpoint.unwrap_or(self.ambient).max(self.floor)
    }

    /// Update temperature with exponential approach to the setpoint.
    fn update(&mut self, dt_seconds: f64) {
        let diff = self.target() - self.current;
        self.current += diff * (1.0 - (-self.drift_rate * dt_seconds).exp());
    }

    /// Jump straight to the setpoint.
    fn settle(&mut self) {
        self.current = self.target();
    }

    /// Cooler power needed to hold the current temperature, in percent.
    fn duty_cycle(&self) -> f64 {
        let span = self.ambient - self.floor;
        if span <= 0.0 {
            return 0.0;
        }
        ((self.ambient - self.current) / span * 100.0).clamp(0.0, 100.0)
    }

    fn current(&self) -> f64 {
        self.current
    }
}

// =============================================================================
// MockHardwareBuilder
// =============================================================================

/// Builder for MockHardware with advanced configuration
pub struct MockHardwareBuilder {
    capabilities: CameraCapabilities,
    mode: MockMode,
    error_config: Option<ErrorConfig>,
    timing_config: Option<TimingConfig>,
    ambient_temperature: f64,
    never_ready: bool,
    empty_readout: bool,
    seed: Option<u64>,
}

impl MockHardwareBuilder {
    /// Start from a capability record.
    #[must_use]
    pub fn new(capabilities: CameraCapabilities) -> Self {
        Self {
            capabilities,
            mode: MockMode::Instant,
            error_config: None,
            timing_config: None,
            ambient_temperature: 20.0,
            never_ready: false,
            empty_readout: false,
            seed: None,
        }
    }

    /// Operational mode.
    #[must_use]
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Error injection. Overrides the chaos-mode default.
    #[must_use]
    pub fn error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = Some(config);
        self
    }

    /// Delays used outside instant mode.
    #[must_use]
    pub fn timing_config(mut self, config: TimingConfig) -> Self {
        self.timing_config = Some(config);
        self
    }

    /// Housing temperature, and the sensor temperature at power-up.
    #[must_use]
    pub fn ambient_temperature(mut self, celsius: f64) -> Self {
        self.ambient_temperature = celsius;
        self
    }

    /// The sensor never reports a frame ready.
    #[must_use]
    pub fn never_ready(mut self) -> Self {
        self.never_ready = true;
        self
    }

    /// Readouts transfer zero bytes.
    #[must_use]
    pub fn empty_readout(mut self) -> Self {
        self.empty_readout = true;
        self
    }

    /// Seed for frame noise and random failures.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Build the simulated camera.
    #[must_use]
    pub fn build(self) -> MockHardware {
        MockHardware::from_builder(self)
    }
}

// =============================================================================
// MockHardware - Simulated Camera
// =============================================================================

/// Counts of hardware calls made so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// `start_capture` calls (including failed ones)
    pub start_capture: u32,
    /// `stop_capture` calls
    pub stop_capture: u32,
    /// `read_frame` calls
    pub read_frame: u32,
    /// `set_temperature_target` calls
    pub set_temperature_target: u32,
    /// `apply_geometry` calls
    pub apply_geometry: u32,
    /// `pulse_guide` calls
    pub pulse_guide: u32,
}

#[derive(Debug, Default)]
struct Counters {
    start_capture: AtomicU32,
    stop_capture: AtomicU32,
    read_frame: AtomicU32,
    set_temperature_target: AtomicU32,
    apply_geometry: AtomicU32,
    pulse_guide: AtomicU32,
}

#[derive(Debug, Clone, Copy)]
struct Capture {
    started: Instant,
    exposure: Duration,
}

#[derive(Debug)]
struct MockState {
    capture: Option<Capture>,
    geometry: FrameGeometry,
    frame_type: FrameType,
    gain: Option<f64>,
    thermal: TemperatureSimulation,
    last_thermal_update: Instant,
    scripted_temperatures: VecDeque<f64>,
    scripted_duty: VecDeque<f64>,
    failing: HashSet<&'static str>,
    never_ready: bool,
    frames_delivered: u64,
}

/// Simulated camera implementing [`HardwareChannel`].
///
/// Simulates:
/// - Integration timing (ready once the exposure time has elapsed)
/// - Star-field frame data sized to the programmed geometry
/// - TEC cooler with exponential drift and a derived duty cycle
/// - Error injection through [`ErrorConfig`] and per-operation failure toggles
///
/// Tests can script temperature and duty readings, and inspect call counts.
///
/// # Example
///
/// ```rust
/// use ccd_core::{CameraCapabilities, HardwareChannel};
/// use ccd_driver_mock::MockHardware;
/// use std::time::Duration;
///
/// let hw = MockHardware::new(CameraCapabilities::simulator());
/// hw.start_capture(Duration::ZERO).unwrap();
/// assert!(hw.poll_ready().unwrap());
/// let mut buffer = vec![0u8; 640 * 480 * 2];
/// assert_eq!(hw.read_frame(&mut buffer).unwrap(), buffer.len());
/// ```
pub struct MockHardware {
    capabilities: CameraCapabilities,
    mode: MockMode,
    timing: TimingConfig,
    errors: ErrorConfig,
    empty_readout: bool,
    state: Mutex<MockState>,
    counters: Counters,
    rng: MockRng,
}

impl MockHardware {
    /// Instant-mode camera with no injected errors.
    #[must_use]
    pub fn new(capabilities: CameraCapabilities) -> Self {
        Self::builder(capabilities).build()
    }

    /// Create a builder for advanced configuration.
    #[must_use]
    pub fn builder(capabilities: CameraCapabilities) -> MockHardwareBuilder {
        MockHardwareBuilder::new(capabilities)
    }

    /// Build from driver configuration (`device.model`, `device.simulation`).
    pub fn from_config(config: &DriverConfig) -> anyhow::Result<Self> {
        let capabilities = CameraCapabilities::for_model(&config.device.model)
            .ok_or_else(|| anyhow::anyhow!("unknown camera model '{}'", config.device.model))?;
        let mode: MockMode = config
            .device
            .simulation
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        Ok(Self::builder(capabilities).mode(mode).build())
    }

    fn from_builder(builder: MockHardwareBuilder) -> Self {
        let timing = builder.timing_config.unwrap_or(match builder.mode {
            MockMode::Instant => TimingConfig::default(),
            MockMode::Realistic | MockMode::Chaos => TimingConfig::ccd(),
        });
        let errors = builder.error_config.unwrap_or_else(|| match builder.mode {
            MockMode::Chaos => ErrorConfig::random_failures_seeded(CHAOS_FAILURE_RATE, builder.seed),
            MockMode::Instant | MockMode::Realistic => ErrorConfig::none(),
        });
        let geometry = FrameGeometry::full_frame(&builder.capabilities);
        let thermal = TemperatureSimulation::new(
            builder.ambient_temperature,
            builder.capabilities.temperature_range.0,
        );

        Self {
            capabilities: builder.capabilities,
            mode: builder.mode,
            timing,
            errors,
            empty_readout: builder.empty_readout,
            state: Mutex::new(MockState {
                capture: None,
                geometry,
                frame_type: FrameType::Light,
                gain: None,
                thermal,
                last_thermal_update: Instant::now(),
                scripted_temperatures: VecDeque::new(),
                scripted_duty: VecDeque::new(),
                failing: HashSet::new(),
                never_ready: builder.never_ready,
                frames_delivered: 0,
            }),
            counters: Counters::default(),
            rng: MockRng::new(builder.seed),
        }
    }

    // === Test hooks ===

    /// Snapshot of hardware call counts.
    #[must_use]
    pub fn call_counts(&self) -> CallCounts {
        CallCounts {
            start_capture: self.counters.start_capture.load(Ordering::SeqCst),
            stop_capture: self.counters.stop_capture.load(Ordering::SeqCst),
            read_frame: self.counters.read_frame.load(Ordering::SeqCst),
            set_temperature_target: self.counters.set_temperature_target.load(Ordering::SeqCst),
            apply_geometry: self.counters.apply_geometry.load(Ordering::SeqCst),
            pulse_guide: self.counters.pulse_guide.load(Ordering::SeqCst),
        }
    }

    /// Queue temperature readings. Each `temperatures()` call takes the next
    /// one; the last stays in effect once the queue is down to one entry.
    pub fn script_temperatures(&self, readings: impl IntoIterator<Item = f64>) {
        self.state.lock().scripted_temperatures.extend(readings);
    }

    /// Queue duty-cycle readings, same semantics as temperatures.
    pub fn script_duty_cycle(&self, readings: impl IntoIterator<Item = f64>) {
        self.state.lock().scripted_duty.extend(readings);
    }

    /// Make every call of `operation` fail until cleared.
    pub fn set_failing(&self, operation: &'static str, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing.insert(operation);
        } else {
            state.failing.remove(operation);
        }
    }

    /// Toggle whether the sensor ever reports ready.
    pub fn set_never_ready(&self, never_ready: bool) {
        self.state.lock().never_ready = never_ready;
    }

    /// Whether a capture is running.
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.state.lock().capture.is_some()
    }

    /// Last programmed geometry.
    #[must_use]
    pub fn geometry(&self) -> FrameGeometry {
        self.state.lock().geometry
    }

    /// Last programmed frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        self.state.lock().frame_type
    }

    /// Last programmed gain.
    #[must_use]
    pub fn gain(&self) -> Option<f64> {
        self.state.lock().gain
    }

    /// Operational mode.
    #[must_use]
    pub fn mode(&self) -> MockMode {
        self.mode
    }

    /// Capability record the camera was built from.
    #[must_use]
    pub fn capabilities(&self) -> &CameraCapabilities {
        &self.capabilities
    }

    // === Internals ===

    fn check(&self, operation: &'static str) -> HwResult<()> {
        if self.state.lock().failing.contains(operation) {
            return Err(HardwareError::with_code(operation, -1, "injected failure"));
        }
        self.errors.check_operation(operation)
    }

    fn communicate(&self) {
        if self.mode.simulates_delays() {
            std::thread::sleep(self.timing.communication());
        }
    }

    fn advance_thermal(&self, state: &mut MockState) {
        let now = Instant::now();
        if self.mode.simulates_delays() {
            let dt = now.duration_since(state.last_thermal_update).as_secs_f64();
            state.thermal.update(dt);
        } else {
            state.thermal.settle();
        }
        state.last_thermal_update = now;
    }
}

fn next_scripted(queue: &mut VecDeque<f64>) -> Option<f64> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().copied()
    }
}

impl HardwareChannel for MockHardware {
    fn start_capture(&self, exposure: Duration) -> HwResult<()> {
        self.counters.start_capture.fetch_add(1, Ordering::SeqCst);
        self.communicate();
        self.check("start_capture")?;
        let mut state = self.state.lock();
        // Status code as the USB firmware reports it: 0 ok, -16 busy.
        let status = if state.capture.is_some() { -16 } else { 0 };
        HardwareError::check_code("start_capture", status)?;
        tracing::debug!(exposure_s = exposure.as_secs_f64(), "Mock capture started");
        state.capture = Some(Capture {
            started: Instant::now(),
            exposure,
        });
        Ok(())
    }

    fn stop_capture(&self) -> HwResult<()> {
        self.counters.stop_capture.fetch_add(1, Ordering::SeqCst);
        self.communicate();
        self.check("stop_capture")?;
        self.state.lock().capture = None;
        tracing::debug!("Mock capture stopped");
        Ok(())
    }

    fn poll_ready(&self) -> HwResult<bool> {
        self.check("poll_ready")?;
        let state = self.state.lock();
        if state.never_ready {
            return Ok(false);
        }
        Ok(state.capture.is_some_and(|capture| {
            capture.started.elapsed() >= capture.exposure + self.timing.ready_latency()
        }))
    }

    fn read_frame(&self, buffer: &mut [u8]) -> HwResult<usize> {
        self.counters.read_frame.fetch_add(1, Ordering::SeqCst);
        self.check("read_frame")?;
        let (geometry, frame_number) = {
            let mut state = self.state.lock();
            if state.capture.take().is_none() {
                return Err(HardwareError::with_code(
                    "read_frame",
                    -5,
                    "no exposure to read out",
                ));
            }
            state.frames_delivered += 1;
            (state.geometry, state.frames_delivered)
        };

        if self.mode.simulates_delays() {
            std::thread::sleep(self.timing.readout());
        }
        if self.empty_readout {
            return Ok(0);
        }
        // Noise varies with a random offset so frames are not bit-identical.
        let noise_seed = frame_number ^ self.rng.gen_range(0..u64::from(u32::MAX));
        Ok(render_star_field(
            buffer,
            geometry.binned_width(),
            geometry.binned_height(),
            geometry.bytes_per_pixel(),
            noise_seed,
        ))
    }

    fn temperatures(&self) -> HwResult<TemperatureSample> {
        self.communicate();
        self.check("temperatures")?;
        let mut state = self.state.lock();
        self.advance_thermal(&mut state);
        let cooler =
            next_scripted(&mut state.scripted_temperatures).unwrap_or(state.thermal.current());
        let ambient = state.thermal.ambient;
        Ok(TemperatureSample {
            ambient,
            base: ambient + 2.0,
            cooler,
        })
    }

    fn set_temperature_target(&self, celsius: f64) -> HwResult<()> {
        self.counters.set_temperature_target.fetch_add(1, Ordering::SeqCst);
        self.communicate();
        self.check("set_temperature_target")?;
        if !self.capabilities.has_cooler {
            return Err(HardwareError::new("set_temperature_target", "no cooler"));
        }
        let mut state = self.state.lock();
        self.advance_thermal(&mut state);
        state.thermal.set_setpoint(celsius);
        Ok(())
    }

    fn cooler_duty_cycle(&self) -> HwResult<f64> {
        self.check("cooler_duty_cycle")?;
        let mut state = self.state.lock();
        if let Some(duty) = next_scripted(&mut state.scripted_duty) {
            return Ok(duty);
        }
        self.advance_thermal(&mut state);
        Ok(state.thermal.duty_cycle())
    }

    fn apply_geometry(&self, geometry: &FrameGeometry) -> HwResult<()> {
        self.counters.apply_geometry.fetch_add(1, Ordering::SeqCst);
        self.check("apply_geometry")?;
        geometry
            .validate(&self.capabilities)
            .map_err(|e| HardwareError::with_code("apply_geometry", -22, e.to_string()))?;
        self.state.lock().geometry = *geometry;
        Ok(())
    }

    fn set_frame_type(&self, frame_type: FrameType) -> HwResult<()> {
        self.check("set_frame_type")?;
        if !self.capabilities.supports_frame_type(frame_type) {
            return Err(HardwareError::new(
                "set_frame_type",
                format!("{} frames not supported", frame_type.as_str()),
            ));
        }
        self.state.lock().frame_type = frame_type;
        Ok(())
    }

    fn set_gain(&self, gain: f64) -> HwResult<()> {
        self.check("set_gain")?;
        match self.capabilities.gain_range {
            Some((min, max)) if gain >= min && gain <= max => {
                self.state.lock().gain = Some(gain);
                Ok(())
            }
            Some(_) => Err(HardwareError::with_code("set_gain", -22, "gain out of range")),
            None => Err(HardwareError::new("set_gain", "gain control not supported")),
        }
    }

    fn pulse_guide(&self, direction: GuideDirection, duration: Duration) -> HwResult<()> {
        self.counters.pulse_guide.fetch_add(1, Ordering::SeqCst);
        self.check("pulse_guide")?;
        if !self.capabilities.has_guide_port {
            return Err(HardwareError::new("pulse_guide", "no ST4 guide port"));
        }
        tracing::debug!(
            direction = direction.as_str(),
            ms = duration.as_millis() as u64,
            "Mock guide pulse"
        );
        if self.mode.simulates_delays() {
            std::thread::sleep(duration);
        }
        Ok(())
    }
}

impl std::fmt::Debug for MockHardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockHardware")
            .field("model", &self.capabilities.model)
            .field("mode", &self.mode)
            .field("calls", &self.call_counts())
            .finish()
    }
}
