//! End-to-end scenarios for a camera device driven through its handle.
//!
//! Every test runs a real device actor over the instant-mode mock, so timing
//! comes from the exposure durations and the configured poll intervals.

use ccd_core::{
    CameraCapabilities, CameraError, DeviceEvent, DriverConfig, EventStream, ExposureOutcome,
    FailureReason, FrameGeometry, HardwareChannel, HwResult, RegulationState, TemperatureSample,
};
use ccd_driver::{CameraDevice, CameraHandle, ExposureState, SetTargetOutcome};
use ccd_driver_mock::{ErrorConfig, ErrorScenario, MockHardware, MockMode, TimingConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("ccd_driver=debug")
        .with_test_writer()
        .try_init();
}

fn fast_config() -> DriverConfig {
    let mut config = DriverConfig::default();
    config.exposure.readout_timeout_ms = 200;
    config.temperature.busy_interval_ms = 20;
    config.temperature.idle_interval_ms = 20;
    config
}

fn spawn(hw: MockHardware, config: &DriverConfig) -> (CameraHandle, EventStream, Arc<MockHardware>) {
    init_tracing();
    let hw = Arc::new(hw);
    let caps = hw.capabilities().clone();
    let (handle, events) = CameraDevice::spawn(hw.clone(), caps, config).unwrap();
    (handle, events, hw)
}

fn simulator() -> MockHardware {
    MockHardware::new(CameraCapabilities::simulator())
}

/// Wait for the next `ExposureDone`, skipping other events.
async fn next_done(events: &mut EventStream, within: Duration) -> (ExposureOutcome, usize) {
    timeout(within, async {
        loop {
            match events.recv().await {
                Some(DeviceEvent::ExposureDone {
                    outcome,
                    byte_count,
                }) => return (outcome, byte_count),
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("no ExposureDone in time")
}

fn count_done(events: &mut EventStream) -> usize {
    events.drain().iter().filter(|e| e.is_terminal()).count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn short_exposure_completes_with_data() {
    let (camera, mut events, hw) = spawn(simulator(), &fast_config());

    let started = Instant::now();
    camera.request_exposure(0.05).await.unwrap();
    let (outcome, bytes) = next_done(&mut events, Duration::from_millis(500)).await;

    assert_eq!(outcome, ExposureOutcome::Complete);
    assert_eq!(bytes, 640 * 480 * 2);
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(hw.call_counts().read_frame, 1);

    let frame = camera.latest_frame().unwrap().unwrap();
    assert_eq!(frame.data.len(), bytes);
    assert_eq!(frame.frame_number, 1);
    assert_eq!(camera.status().await.unwrap().exposure, ExposureState::Complete);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_long_exposure_stops_hardware_once() {
    let (camera, mut events, hw) = spawn(simulator(), &fast_config());

    camera.request_exposure(5.0).await.unwrap();
    sleep(Duration::from_secs(1)).await;
    camera.abort_exposure().await.unwrap();

    let (outcome, bytes) = next_done(&mut events, Duration::from_millis(100)).await;
    assert_eq!(outcome, ExposureOutcome::Aborted);
    assert_eq!(bytes, 0);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(count_done(&mut events), 0);
    assert_eq!(hw.call_counts().stop_capture, 1);
    assert_eq!(hw.call_counts().read_frame, 0);
    assert_eq!(camera.status().await.unwrap().exposure, ExposureState::Aborted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_during_readout_discards_the_frame() {
    let hw = MockHardware::builder(CameraCapabilities::simulator())
        .mode(MockMode::Realistic)
        .timing_config(TimingConfig {
            frame_readout_ms: 300,
            ..TimingConfig::ccd()
        })
        .build();
    let (camera, mut events, hw) = spawn(hw, &fast_config());

    camera.request_exposure(0.05).await.unwrap();
    timeout(Duration::from_secs(2), async {
        while camera.status().await.unwrap().exposure != ExposureState::Downloading {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("readout never started");
    camera.abort_exposure().await.unwrap();

    let (outcome, bytes) = next_done(&mut events, Duration::from_millis(100)).await;
    assert_eq!(outcome, ExposureOutcome::Aborted);
    assert_eq!(bytes, 0);

    // Let the transfer run out; its data must not become the latest frame.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(hw.call_counts().read_frame, 1);
    assert!(camera.latest_frame().unwrap().is_none());
    assert_eq!(count_done(&mut events), 0);
    assert_eq!(camera.status().await.unwrap().exposure, ExposureState::Aborted);
}

/// Mock whose start, stop and temperature reads block like a slow USB link.
struct SlowVendorCalls {
    inner: MockHardware,
    delay: Duration,
}

impl HardwareChannel for SlowVendorCalls {
    fn start_capture(&self, exposure: Duration) -> HwResult<()> {
        std::thread::sleep(self.delay);
        self.inner.start_capture(exposure)
    }
    fn stop_capture(&self) -> HwResult<()> {
        std::thread::sleep(self.delay);
        self.inner.stop_capture()
    }
    fn poll_ready(&self) -> HwResult<bool> {
        self.inner.poll_ready()
    }
    fn read_frame(&self, buffer: &mut [u8]) -> HwResult<usize> {
        self.inner.read_frame(buffer)
    }
    fn temperatures(&self) -> HwResult<TemperatureSample> {
        std::thread::sleep(self.delay);
        self.inner.temperatures()
    }
    fn set_temperature_target(&self, celsius: f64) -> HwResult<()> {
        self.inner.set_temperature_target(celsius)
    }
    fn cooler_duty_cycle(&self) -> HwResult<f64> {
        self.inner.cooler_duty_cycle()
    }
    fn apply_geometry(&self, geometry: &FrameGeometry) -> HwResult<()> {
        self.inner.apply_geometry(geometry)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn slow_vendor_calls_do_not_stall_commands() {
    init_tracing();
    let caps = CameraCapabilities::simulator();
    let hw = Arc::new(SlowVendorCalls {
        inner: MockHardware::new(caps.clone()),
        delay: Duration::from_millis(400),
    });
    let (camera, mut events) = CameraDevice::spawn(hw, caps, &fast_config()).unwrap();

    // The first cooler poll is reading temperatures by now.
    let started = Instant::now();
    camera.status().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));

    camera.request_exposure(2.0).await.unwrap();
    let started = Instant::now();
    let status = camera.status().await.unwrap();
    assert!(
        started.elapsed() < Duration::from_millis(100),
        "status took {:?} while start_capture ran",
        started.elapsed()
    );
    assert_eq!(status.exposure, ExposureState::Requested);

    camera.abort_exposure().await.unwrap();
    let (outcome, _) = next_done(&mut events, Duration::from_millis(100)).await;
    assert_eq!(outcome, ExposureOutcome::Aborted);
}

/// Collect progress events until the next `ExposureDone`.
async fn progress_until_done(events: &mut EventStream, within: Duration) -> Vec<f64> {
    let mut progress = Vec::new();
    timeout(within, async {
        while let Some(event) = events.recv().await {
            match event {
                DeviceEvent::ExposureProgress { remaining_s } => progress.push(remaining_s),
                DeviceEvent::ExposureDone { .. } => break,
                _ => {}
            }
        }
    })
    .await
    .expect("no ExposureDone in time");
    progress
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn progress_ticks_once_per_second() {
    let (camera, mut events, _hw) = spawn(simulator(), &fast_config());

    camera.request_exposure(2.5).await.unwrap();
    let progress = progress_until_done(&mut events, Duration::from_secs(4)).await;
    assert_eq!(progress, vec![3.0, 2.0]);

    // Below the progress threshold nothing but the terminal event is sent.
    camera.request_exposure(0.3).await.unwrap();
    assert!(progress_until_done(&mut events, Duration::from_secs(2))
        .await
        .is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_request_rejected_while_active() {
    let (camera, mut events, _hw) = spawn(simulator(), &fast_config());

    camera.request_exposure(0.5).await.unwrap();
    assert!(matches!(
        camera.request_exposure(0.5).await,
        Err(CameraError::InvalidStateTransition { .. })
    ));
    let (outcome, _) = next_done(&mut events, Duration::from_secs(2)).await;
    assert_eq!(outcome, ExposureOutcome::Complete);
    camera.request_exposure(0.05).await.unwrap();
    next_done(&mut events, Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn geometry_change_rejected_mid_capture() {
    let (camera, mut events, hw) = spawn(simulator(), &fast_config());
    let binned = FrameGeometry {
        bin_x: 2,
        bin_y: 2,
        ..FrameGeometry::full_frame(camera.capabilities())
    };

    camera.request_exposure(2.0).await.unwrap();
    assert!(matches!(
        camera.set_geometry(binned).await,
        Err(CameraError::GeometryMismatch(_))
    ));
    assert_eq!(hw.call_counts().apply_geometry, 1);
    camera.abort_exposure().await.unwrap();
    next_done(&mut events, Duration::from_millis(100)).await;

    camera.set_geometry(binned).await.unwrap();
    assert_eq!(hw.geometry(), binned);
    camera.request_exposure(0.05).await.unwrap();
    let (outcome, bytes) = next_done(&mut events, Duration::from_secs(1)).await;
    assert_eq!(outcome, ExposureOutcome::Complete);
    assert_eq!(bytes, 320 * 240 * 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_geometry_rejected() {
    let (camera, _events, hw) = spawn(simulator(), &fast_config());
    let too_wide = FrameGeometry {
        width: 10_000,
        ..FrameGeometry::full_frame(camera.capabilities())
    };
    assert!(matches!(
        camera.set_geometry(too_wide).await,
        Err(CameraError::InvalidGeometry(_))
    ));
    assert_eq!(hw.call_counts().apply_geometry, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exactly_one_terminal_event_when_abort_races_completion() {
    let (camera, mut events, _hw) = spawn(simulator(), &fast_config());

    for _ in 0..5 {
        camera.request_exposure(0.02).await.unwrap();
        // May land before or after completion; either way one terminal event.
        let _ = camera.abort_exposure().await;
        next_done(&mut events, Duration::from_secs(1)).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(count_done(&mut events), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_retries_then_succeeds() {
    let hw = MockHardware::builder(CameraCapabilities::simulator())
        .error_config(ErrorConfig::scenario(ErrorScenario::FailFirstN {
            operation: "start_capture",
            count: 2,
        }))
        .build();
    let (camera, mut events, hw) = spawn(hw, &fast_config());

    camera.request_exposure(0.05).await.unwrap();
    let (outcome, _) = next_done(&mut events, Duration::from_secs(1)).await;
    assert_eq!(outcome, ExposureOutcome::Complete);
    assert_eq!(hw.call_counts().start_capture, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_failure_after_retries() {
    let hw = MockHardware::builder(CameraCapabilities::simulator())
        .error_config(ErrorConfig::scenario(ErrorScenario::FailFirstN {
            operation: "start_capture",
            count: 10,
        }))
        .build();
    let (camera, mut events, hw) = spawn(hw, &fast_config());

    camera.request_exposure(0.05).await.unwrap();
    let (outcome, _) = next_done(&mut events, Duration::from_secs(1)).await;
    assert!(matches!(
        outcome,
        ExposureOutcome::Failed(FailureReason::StartFailure(_))
    ));
    assert_eq!(hw.call_counts().start_capture, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readout_timeout_fails_exposure() {
    let hw = MockHardware::builder(CameraCapabilities::simulator())
        .never_ready()
        .build();
    let (camera, mut events, hw) = spawn(hw, &fast_config());

    camera.request_exposure(0.05).await.unwrap();
    let (outcome, bytes) = next_done(&mut events, Duration::from_secs(1)).await;
    assert_eq!(outcome, ExposureOutcome::Failed(FailureReason::Timeout));
    assert_eq!(bytes, 0);
    assert_eq!(hw.call_counts().read_frame, 0);
    assert!(!hw.is_capturing());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_error_fails_exposure() {
    let hw = simulator();
    hw.set_failing("read_frame", true);
    let (camera, mut events, _hw) = spawn(hw, &fast_config());

    camera.request_exposure(0.05).await.unwrap();
    let (outcome, _) = next_done(&mut events, Duration::from_secs(1)).await;
    assert!(matches!(
        outcome,
        ExposureOutcome::Failed(FailureReason::Hardware(_))
    ));
    assert!(camera.latest_frame().unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_cooler_target_calls_hardware_once() {
    let (camera, mut events, hw) = spawn(simulator(), &fast_config());

    assert_eq!(
        camera.set_cooler_target(-10.0).await.unwrap(),
        SetTargetOutcome::Regulating
    );
    timeout(Duration::from_secs(1), async {
        while let Some(event) = events.recv().await {
            if let DeviceEvent::TemperatureReading {
                state: RegulationState::Ok,
                ..
            } = event
            {
                break;
            }
        }
    })
    .await
    .unwrap();

    for _ in 0..3 {
        assert_eq!(
            camera.set_cooler_target(-10.0).await.unwrap(),
            SetTargetOutcome::AlreadyAtTarget
        );
    }
    assert_eq!(hw.call_counts().set_temperature_target, 1);

    let status = camera.status().await.unwrap();
    assert_eq!(status.cooler.state, RegulationState::Ok);
    assert_eq!(status.setpoint.map(|s| s.target), Some(-10.0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cooler_target_outside_range_rejected() {
    let (camera, _events, hw) = spawn(simulator(), &fast_config());
    assert!(matches!(
        camera.set_cooler_target(-80.0).await,
        Err(CameraError::TemperatureOutOfRange { .. })
    ));
    assert_eq!(hw.call_counts().set_temperature_target, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duty_cycle_reported_with_hysteresis() {
    let hw = simulator();
    hw.script_duty_cycle([42.0, 42.5, 44.0]);
    let (_camera, mut events, _hw) = spawn(hw, &fast_config());

    sleep(Duration::from_millis(200)).await;
    let duties: Vec<f64> = events
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            DeviceEvent::CoolerDuty { percent } => Some(percent),
            _ => None,
        })
        .collect();
    assert_eq!(duties, vec![42.0, 44.0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn temperature_error_reported_once_then_recovers() {
    let hw = simulator();
    hw.set_failing("temperatures", true);
    let (camera, mut events, hw) = spawn(hw, &fast_config());

    sleep(Duration::from_millis(200)).await;
    let alerts = events
        .drain()
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                DeviceEvent::TemperatureReading {
                    state: RegulationState::Alert,
                    ..
                }
            )
        })
        .count();
    assert_eq!(alerts, 1);
    assert_eq!(camera.status().await.unwrap().cooler.state, RegulationState::Alert);

    hw.set_failing("temperatures", false);
    let (celsius, state) = timeout(Duration::from_secs(1), async {
        loop {
            if let Some(DeviceEvent::TemperatureReading { celsius, state }) = events.recv().await {
                return (celsius, state);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(state, RegulationState::Idle);
    assert_eq!(celsius, 20.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_aborts_exposure_and_rejects_commands() {
    let (camera, mut events, hw) = spawn(simulator(), &fast_config());

    camera.request_exposure(3.0).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    camera.disconnect().await.unwrap();

    let (outcome, _) = next_done(&mut events, Duration::from_millis(100)).await;
    assert_eq!(outcome, ExposureOutcome::Aborted);
    assert_eq!(hw.call_counts().stop_capture, 1);

    assert!(matches!(
        camera.request_exposure(1.0).await,
        Err(CameraError::Disconnected)
    ));
    assert!(matches!(camera.status().await, Err(CameraError::Disconnected)));
    assert!(!camera.is_connected());
}
