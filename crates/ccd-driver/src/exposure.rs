//! Single-exposure lifecycle.
//!
//! # State Machine
//!
//! ```text
//!            request                started               remaining <= fine
//!   Idle ─────────────▶ Requested ───────────▶ InProgress ────────────────────▶ AwaitingReadout
//!    ▲                     │                      │  ▲ tick                          │ ready
//!    │                     │ retries exhausted    └──┘                               ▼
//!    │                     ▼                                                    Downloading
//!    │                  Failed ◀────────────── timeout / hardware error ────────────┤
//!    │                                                                              │ bytes > 0
//!    └──────── Complete / Failed / Aborted accept a new request ◀─── Complete ◀─────┘
//! ```
//!
//! `abort_exposure` moves any active state (Requested through Downloading) to
//! `Aborted` immediately.
//!
//! # Scheduling
//!
//! The controller does not own a task. The device actor calls into it:
//!
//! - [`ExposureController::next_deadline`] / [`ExposureController::on_timer`]
//!   drive the countdown from the actor's `select!` loop.
//! - The hardware start sequence (bounded retries) runs as a spawned async task
//!   that makes each `start_capture` call on the blocking pool.
//! - The final approach (spin on `poll_ready`) and the readout run on one
//!   blocking thread, holding the frame buffer write guard during `read_frame`.
//! - `stop_capture` on abort or timeout is awaited on the blocking pool, so the
//!   actor pauses for it without tying up a worker thread.
//!
//! Both background tasks report back with [`ControllerMessage`]s tagged with the
//! request id, and [`ExposureController::handle_message`] applies them. A message
//! for a request that is no longer current, or that arrives after the request
//! reached a terminal state, is dropped, so every accepted request produces
//! exactly one `ExposureDone`.
//!
//! # Cancellation
//!
//! Each request gets its own `AtomicBool`. Abort sets it; the start task checks
//! it between attempts and after a successful start, the blocking task checks it
//! on entry, on every spin iteration and once more when `read_frame` returns.
//! A transfer that finishes after the abort is never committed, so the buffer
//! holds no frame for an aborted request.
//!
//! The start task always ends with exactly one of `Started`, `StartCancelled`
//! or `StartFailed`.

use crate::blocking;
use crate::frame_buffer::FrameBufferManager;
use ccd_core::config::ExposureConfig;
use ccd_core::error::{CameraError, CameraResult};
use ccd_core::events::{DeviceEvent, EventSink, ExposureOutcome, FailureReason};
use ccd_core::geometry::FrameGeometry;
use ccd_core::hardware::HardwareChannel;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Spin interval bounds while waiting for the sensor to report ready.
const MIN_READY_POLL: Duration = Duration::from_millis(1);
const MAX_READY_POLL: Duration = Duration::from_millis(5);

// =============================================================================
// State
// =============================================================================

/// Exposure lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ExposureState {
    /// No exposure has been requested yet.
    Idle,
    /// Accepted; the hardware start sequence is running.
    Requested,
    /// Integrating.
    InProgress {
        /// Time left as of the last countdown tick.
        remaining: Duration,
    },
    /// Integration time is up; waiting for the sensor to report ready.
    AwaitingReadout,
    /// Transferring the frame into the buffer.
    Downloading,
    /// Frame delivered.
    Complete,
    /// Ended with an error.
    Failed(FailureReason),
    /// Aborted by the caller.
    Aborted,
}

impl ExposureState {
    /// Whether an exposure is in flight (a new request would be rejected).
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ExposureState::Requested
                | ExposureState::InProgress { .. }
                | ExposureState::AwaitingReadout
                | ExposureState::Downloading
        )
    }

    /// Whether the state ends an exposure.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExposureState::Complete | ExposureState::Failed(_) | ExposureState::Aborted
        )
    }

    /// Short state name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ExposureState::Idle => "Idle",
            ExposureState::Requested => "Requested",
            ExposureState::InProgress { .. } => "InProgress",
            ExposureState::AwaitingReadout => "AwaitingReadout",
            ExposureState::Downloading => "Downloading",
            ExposureState::Complete => "Complete",
            ExposureState::Failed(_) => "Failed",
            ExposureState::Aborted => "Aborted",
        }
    }
}

impl fmt::Display for ExposureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExposureState::InProgress { remaining } => {
                write!(f, "InProgress ({:.2} s left)", remaining.as_secs_f64())
            }
            ExposureState::Failed(reason) => write!(f, "Failed ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// An accepted exposure. Immutable while in flight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureRequest {
    /// Monotonic request id.
    pub id: u64,
    /// Integration time.
    pub duration: Duration,
    /// When the request was accepted.
    pub requested_at: Instant,
}

/// Reports from the start task and the readout thread.
#[derive(Debug)]
pub enum ControllerMessage {
    /// Hardware accepted the capture.
    Started {
        /// Request id.
        id: u64,
        /// When `start_capture` returned; the countdown runs from here.
        started_at: Instant,
    },
    /// The request was aborted before or while `start_capture` ran; the start
    /// task stopped any capture it began.
    StartCancelled {
        /// Request id.
        id: u64,
    },
    /// Hardware refused to start after all attempts.
    StartFailed {
        /// Request id.
        id: u64,
        /// Error to report.
        error: CameraError,
    },
    /// Sensor reported ready; transfer begins.
    ReadoutStarted {
        /// Request id.
        id: u64,
    },
    /// Wait or transfer finished. `Ok(bytes)` on a completed transfer.
    ReadoutFinished {
        /// Request id.
        id: u64,
        /// Bytes read, or why the wait or transfer failed.
        result: CameraResult<usize>,
    },
}

// =============================================================================
// ExposureController
// =============================================================================

/// Owns the exposure state machine of one camera.
pub struct ExposureController {
    hardware: Arc<dyn HardwareChannel>,
    buffer: FrameBufferManager,
    config: ExposureConfig,
    events: EventSink,
    messages: mpsc::UnboundedSender<ControllerMessage>,

    state: ExposureState,
    request: Option<ExposureRequest>,
    started_at: Option<Instant>,
    cancel: Arc<AtomicBool>,
    next_id: u64,
    deadline: Option<Instant>,
    last_progress: Option<u64>,
    /// Requests aborted while their start task ran; each is cleared by that
    /// task's final report, and `Started` for one of them stops the capture.
    deferred_stops: Vec<u64>,
}

impl ExposureController {
    /// Create a controller. `messages` is the sending half of the channel the
    /// device actor feeds back into [`handle_message`](Self::handle_message).
    pub fn new(
        hardware: Arc<dyn HardwareChannel>,
        buffer: FrameBufferManager,
        config: ExposureConfig,
        events: EventSink,
        messages: mpsc::UnboundedSender<ControllerMessage>,
    ) -> Self {
        Self {
            hardware,
            buffer,
            config,
            events,
            messages,
            state: ExposureState::Idle,
            request: None,
            started_at: None,
            cancel: Arc::new(AtomicBool::new(false)),
            next_id: 0,
            deadline: None,
            last_progress: None,
            deferred_stops: Vec::new(),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &ExposureState {
        &self.state
    }

    /// The request in flight, if any.
    #[must_use]
    pub fn current_request(&self) -> Option<&ExposureRequest> {
        self.request.as_ref()
    }

    /// When the countdown wants its next tick.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Accept a new exposure of `duration_s` seconds for `geometry`.
    ///
    /// Returns the request id. The outcome arrives later as `ExposureDone`.
    pub fn request_exposure(
        &mut self,
        duration_s: f64,
        geometry: &FrameGeometry,
    ) -> CameraResult<u64> {
        if self.state.is_active() {
            return Err(CameraError::InvalidStateTransition {
                operation: "start exposure",
                state: self.state.name().to_string(),
            });
        }
        if !duration_s.is_finite() || duration_s <= 0.0 || duration_s > self.config.max_duration_s
        {
            return Err(CameraError::InvalidDuration(duration_s));
        }
        self.buffer.check_geometry(geometry)?;

        self.next_id += 1;
        let request = ExposureRequest {
            id: self.next_id,
            duration: Duration::from_secs_f64(duration_s),
            requested_at: Instant::now(),
        };
        if duration_s > self.config.verbose_threshold_s {
            tracing::info!(id = request.id, duration_s, "Taking exposure");
        } else {
            tracing::debug!(id = request.id, duration_s, "Taking exposure");
        }

        self.cancel = Arc::new(AtomicBool::new(false));
        self.request = Some(request);
        self.started_at = None;
        self.deadline = None;
        self.last_progress = None;
        self.state = ExposureState::Requested;

        tokio::spawn(run_start_sequence(
            Arc::clone(&self.hardware),
            request,
            self.config.start_attempts.max(1),
            self.config.start_retry_delay(),
            Arc::clone(&self.cancel),
            self.messages.clone(),
        ));
        Ok(request.id)
    }

    /// Abort the exposure in flight.
    ///
    /// Returns once the hardware stop (if one is due now) has completed.
    pub async fn abort_exposure(&mut self) -> CameraResult<()> {
        let Some(request) = self.request else {
            return Err(self.invalid("abort exposure"));
        };
        match self.state {
            ExposureState::Requested => {
                self.cancel.store(true, Ordering::SeqCst);
                // The start task stops the capture itself if its start call
                // succeeds after this point; otherwise `Started` does it.
                self.deferred_stops.push(request.id);
            }
            ExposureState::InProgress { .. }
            | ExposureState::AwaitingReadout
            | ExposureState::Downloading => {
                self.cancel.store(true, Ordering::SeqCst);
                self.stop_hardware().await;
            }
            _ => return Err(self.invalid("abort exposure")),
        }
        tracing::info!(id = request.id, "Exposure aborted");
        self.finish(ExposureOutcome::Aborted, 0);
        Ok(())
    }

    /// Countdown tick. Called by the actor when [`next_deadline`](Self::next_deadline) passes.
    pub fn on_timer(&mut self) {
        self.deadline = None;
        if !matches!(self.state, ExposureState::InProgress { .. }) {
            return;
        }
        let (Some(request), Some(started_at)) = (self.request, self.started_at) else {
            return;
        };

        let now = Instant::now();
        let remaining = request
            .duration
            .saturating_sub(now.duration_since(started_at));
        self.state = ExposureState::InProgress { remaining };
        let secs = remaining.as_secs_f64();

        if secs >= 1.0 {
            if request.duration.as_secs_f64() >= self.config.progress_threshold_s {
                let whole = secs.ceil() as u64;
                if self.last_progress != Some(whole) {
                    self.last_progress = Some(whole);
                    self.events.emit(DeviceEvent::ExposureProgress {
                        remaining_s: whole as f64,
                    });
                }
            }
            // Land the next tick on a whole second of remaining time.
            let frac = secs - secs.floor();
            let delay = if frac < 1e-3 { 1.0 } else { frac };
            self.deadline = Some(now + Duration::from_secs_f64(delay));
        } else if secs > self.config.medium_threshold_s {
            self.deadline = Some(now + self.config.medium_interval());
        } else if secs > self.config.fine_threshold_s {
            self.deadline = Some(now + self.config.fine_interval());
        } else {
            self.begin_final_approach(request, started_at);
        }
    }

    /// Apply a report from the start task or the readout thread.
    pub async fn handle_message(&mut self, message: ControllerMessage) {
        let current = self.request.map(|r| r.id);
        match message {
            ControllerMessage::Started { id, started_at } => {
                if self.take_deferred_stop(id) {
                    tracing::debug!(id, "Capture started after abort, stopping");
                    self.stop_hardware().await;
                    return;
                }
                if current != Some(id) || self.state != ExposureState::Requested {
                    tracing::debug!(id, "Discarding stale start report");
                    return;
                }
                let Some(request) = self.request else { return };
                self.started_at = Some(started_at);
                self.state = ExposureState::InProgress {
                    remaining: request.duration,
                };
                self.on_timer();
            }
            ControllerMessage::StartCancelled { id } => {
                self.take_deferred_stop(id);
            }
            ControllerMessage::StartFailed { id, error } => {
                if self.take_deferred_stop(id) {
                    return;
                }
                if current != Some(id) || self.state != ExposureState::Requested {
                    tracing::debug!(id, "Discarding stale start failure");
                    return;
                }
                tracing::error!(id, %error, "Exposure failed to start");
                self.finish(ExposureOutcome::Failed(FailureReason::from(&error)), 0);
            }
            ControllerMessage::ReadoutStarted { id } => {
                if current == Some(id) && self.state == ExposureState::AwaitingReadout {
                    self.state = ExposureState::Downloading;
                }
            }
            ControllerMessage::ReadoutFinished { id, result } => {
                let in_readout = matches!(
                    self.state,
                    ExposureState::AwaitingReadout | ExposureState::Downloading
                );
                if current != Some(id) || !in_readout {
                    tracing::debug!(id, "Discarding late readout result");
                    return;
                }
                match result {
                    Ok(0) => {
                        tracing::warn!(id, "Readout returned no data");
                        self.finish(ExposureOutcome::Failed(FailureReason::EmptyReadout), 0);
                    }
                    Ok(bytes) => {
                        tracing::debug!(id, bytes, "Exposure complete");
                        self.finish(ExposureOutcome::Complete, bytes);
                    }
                    Err(error) => {
                        tracing::error!(id, %error, "Exposure failed");
                        if matches!(error, CameraError::HardwareReadTimeout { .. }) {
                            self.stop_hardware().await;
                        }
                        self.finish(ExposureOutcome::Failed(FailureReason::from(&error)), 0);
                    }
                }
            }
        }
    }

    fn begin_final_approach(&mut self, request: ExposureRequest, started_at: Instant) {
        self.state = ExposureState::AwaitingReadout;
        let context = ReadoutContext {
            id: request.id,
            hardware: Arc::clone(&self.hardware),
            buffer: self.buffer.clone(),
            cancel: Arc::clone(&self.cancel),
            expected_end: started_at + request.duration,
            timeout: self.config.readout_timeout(),
            messages: self.messages.clone(),
        };
        tokio::task::spawn_blocking(move || context.run());
    }

    fn finish(&mut self, outcome: ExposureOutcome, byte_count: usize) {
        self.state = match &outcome {
            ExposureOutcome::Complete => ExposureState::Complete,
            ExposureOutcome::Failed(reason) => ExposureState::Failed(reason.clone()),
            ExposureOutcome::Aborted => ExposureState::Aborted,
        };
        self.request = None;
        self.started_at = None;
        self.deadline = None;
        self.events
            .emit(DeviceEvent::ExposureDone { outcome, byte_count });
    }

    async fn stop_hardware(&self) {
        if let Err(err) = blocking::call(&self.hardware, "stop_capture", |hw| hw.stop_capture()).await
        {
            tracing::warn!(%err, "Failed to stop capture");
        }
    }

    fn take_deferred_stop(&mut self, id: u64) -> bool {
        let before = self.deferred_stops.len();
        self.deferred_stops.retain(|&pending| pending != id);
        self.deferred_stops.len() != before
    }

    fn invalid(&self, operation: &'static str) -> CameraError {
        CameraError::InvalidStateTransition {
            operation,
            state: self.state.name().to_string(),
        }
    }
}

impl fmt::Debug for ExposureController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExposureController")
            .field("state", &self.state)
            .field("request", &self.request)
            .field("deadline", &self.deadline)
            .finish()
    }
}

// =============================================================================
// Background work
// =============================================================================

async fn run_start_sequence(
    hardware: Arc<dyn HardwareChannel>,
    request: ExposureRequest,
    attempts: u32,
    retry_delay: Duration,
    cancel: Arc<AtomicBool>,
    messages: mpsc::UnboundedSender<ControllerMessage>,
) {
    let mut last_error = None;
    for attempt in 1..=attempts {
        if cancel.load(Ordering::SeqCst) {
            let _ = messages.send(ControllerMessage::StartCancelled { id: request.id });
            return;
        }
        let duration = request.duration;
        let started = blocking::call(&hardware, "start_capture", move |hw| {
            hw.start_capture(duration)
        })
        .await;
        match started {
            Ok(()) => {
                if cancel.load(Ordering::SeqCst) {
                    // Aborted while the start call was in flight.
                    if let Err(err) =
                        blocking::call(&hardware, "stop_capture", |hw| hw.stop_capture()).await
                    {
                        tracing::warn!(%err, "Failed to stop capture after abort");
                    }
                    let _ = messages.send(ControllerMessage::StartCancelled { id: request.id });
                    return;
                }
                let _ = messages.send(ControllerMessage::Started {
                    id: request.id,
                    started_at: Instant::now(),
                });
                return;
            }
            Err(err) => {
                tracing::warn!(id = request.id, attempt, attempts, %err, "Capture start failed");
                last_error = Some(err);
                if attempt < attempts {
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }
    if let Some(source) = last_error {
        let _ = messages.send(ControllerMessage::StartFailed {
            id: request.id,
            error: CameraError::HardwareStartFailure { attempts, source },
        });
    }
}

struct ReadoutContext {
    id: u64,
    hardware: Arc<dyn HardwareChannel>,
    buffer: FrameBufferManager,
    cancel: Arc<AtomicBool>,
    expected_end: Instant,
    timeout: Duration,
    messages: mpsc::UnboundedSender<ControllerMessage>,
}

impl ReadoutContext {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn report(&self, message: ControllerMessage) {
        let _ = self.messages.send(message);
    }

    /// Spin until ready, then read the frame under the buffer guard.
    fn run(self) {
        if self.cancelled() {
            return;
        }
        let give_up = self.expected_end + self.timeout;
        loop {
            if self.cancelled() {
                return;
            }
            match self.hardware.poll_ready() {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => {
                    self.report(ControllerMessage::ReadoutFinished {
                        id: self.id,
                        result: Err(err.into()),
                    });
                    return;
                }
            }
            let now = Instant::now();
            if now >= give_up {
                self.report(ControllerMessage::ReadoutFinished {
                    id: self.id,
                    result: Err(CameraError::HardwareReadTimeout {
                        waited: now.saturating_duration_since(self.expected_end),
                    }),
                });
                return;
            }
            let pause = (self.expected_end.saturating_duration_since(now) / 10)
                .clamp(MIN_READY_POLL, MAX_READY_POLL);
            std::thread::sleep(pause);
        }

        self.report(ControllerMessage::ReadoutStarted { id: self.id });
        let mut guard = self.buffer.acquire_for_write();
        if self.cancelled() {
            return;
        }
        let result = match self.hardware.read_frame(guard.as_mut_slice()) {
            Ok(_) if self.cancelled() => {
                // Dropping the guard uncommitted leaves the buffer empty.
                tracing::debug!(id = self.id, "Discarding frame read after abort");
                return;
            }
            Ok(0) => Ok(0),
            Ok(bytes) => Ok(guard.commit(bytes)),
            Err(err) => Err(err.into()),
        };
        self.report(ControllerMessage::ReadoutFinished {
            id: self.id,
            result,
        });
    }
}
