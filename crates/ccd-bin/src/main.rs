//! `ccd-daemon`: run a simulated camera through the driver core.
//!
//! # Usage
//!
//! Take three 2-second exposures binned 2x2:
//! ```bash
//! ccd-daemon --config config/ccd.toml expose --duration 2 --count 3 --bin 2
//! ```
//!
//! Cool to -10 °C and report until the setpoint is reached:
//! ```bash
//! ccd-daemon cool -10
//! ```
//!
//! Print the capability record of the configured model:
//! ```bash
//! ccd-daemon info
//! ```

mod logging;

use anyhow::{bail, Context, Result};
use ccd_core::{
    DeviceEvent, DriverConfig, EventStream, ExposureOutcome, FrameGeometry, FrameType,
    RegulationState,
};
use ccd_driver::{CameraDevice, CameraHandle, SetTargetOutcome};
use ccd_driver_mock::MockHardware;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "ccd-daemon")]
#[command(about = "Drive a simulated CCD camera through the rust-ccd core", long_about = None)]
struct Cli {
    /// Driver configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Camera model, overriding `device.model`
    #[arg(long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take one or more exposures
    Expose {
        /// Exposure time in seconds
        #[arg(long, default_value_t = 1.0)]
        duration: f64,

        /// Number of frames
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Symmetric binning factor
        #[arg(long)]
        bin: Option<u32>,

        /// Frame type (light, bias, dark, flat)
        #[arg(long, default_value = "light")]
        frame_type: FrameType,

        /// Cooler setpoint to request before exposing
        #[arg(long, allow_hyphen_values = true)]
        cooler_target: Option<f64>,
    },

    /// Cool to a setpoint and report until it is reached
    Cool {
        /// Setpoint in Celsius
        #[arg(allow_hyphen_values = true)]
        target: f64,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },

    /// Print the capability record of the configured model as JSON
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => DriverConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DriverConfig::load()?,
    };
    if let Some(model) = cli.model {
        config.device.model = model;
    }
    config.validate()?;

    let tracing_config =
        logging::TracingConfig::from_logging_config(&config.logging).map_err(anyhow::Error::msg)?;
    logging::init(&tracing_config).map_err(anyhow::Error::msg)?;

    let hardware = Arc::new(MockHardware::from_config(&config)?);
    let capabilities = hardware.capabilities().clone();

    if let Commands::Info = cli.command {
        println!("{}", serde_json::to_string_pretty(&capabilities)?);
        return Ok(());
    }

    tracing::info!(
        model = %capabilities.model,
        mode = ?hardware.mode(),
        "Starting simulated camera"
    );
    let (camera, mut events) = CameraDevice::spawn(hardware, capabilities, &config)?;

    let result = tokio::select! {
        result = run_command(&camera, &mut events, cli.command) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted");
            Ok(())
        }
    };

    camera.disconnect().await?;
    // Log whatever the disconnect produced (an Aborted exposure, for one).
    while let Some(event) = events.try_recv() {
        log_event(&event);
    }
    result
}

async fn run_command(
    camera: &CameraHandle,
    events: &mut EventStream,
    command: Commands,
) -> Result<()> {
    match command {
        Commands::Expose {
            duration,
            count,
            bin,
            frame_type,
            cooler_target,
        } => {
            if let Some(target) = cooler_target {
                let outcome = camera.set_cooler_target(target).await?;
                tracing::info!(target, ?outcome, "Cooler setpoint requested");
            }
            if let Some(bin) = bin {
                let geometry = FrameGeometry {
                    bin_x: bin,
                    bin_y: bin,
                    ..FrameGeometry::full_frame(camera.capabilities())
                };
                camera.set_geometry(geometry).await?;
            }
            camera.set_frame_type(frame_type).await?;
            expose(camera, events, duration, count).await
        }
        Commands::Cool { target, timeout } => cool(camera, events, target, timeout).await,
        Commands::Info => Ok(()),
    }
}

async fn expose(
    camera: &CameraHandle,
    events: &mut EventStream,
    duration: f64,
    count: u32,
) -> Result<()> {
    for frame in 1..=count {
        let id = camera.request_exposure(duration).await?;
        tracing::info!(frame, count, id, duration, "Exposure requested");

        loop {
            let Some(event) = events.recv().await else {
                bail!("camera event stream closed");
            };
            log_event(&event);
            if let DeviceEvent::ExposureDone { outcome, .. } = event {
                match outcome {
                    ExposureOutcome::Complete => break,
                    ExposureOutcome::Failed(reason) => bail!("exposure {} failed: {}", id, reason),
                    ExposureOutcome::Aborted => bail!("exposure {} aborted", id),
                }
            }
        }

        if let Some(frame) = camera.latest_frame()? {
            tracing::info!(
                frame_number = frame.frame_number,
                bytes = frame.data.len(),
                width = frame.geometry.binned_width(),
                height = frame.geometry.binned_height(),
                "Frame ready"
            );
        }
    }
    Ok(())
}

async fn cool(
    camera: &CameraHandle,
    events: &mut EventStream,
    target: f64,
    timeout_s: u64,
) -> Result<()> {
    let outcome = camera.set_cooler_target(target).await?;
    tracing::info!(target, ?outcome, "Cooler setpoint requested");
    if outcome == SetTargetOutcome::AlreadyAtTarget {
        return Ok(());
    }

    tokio::time::timeout(
        Duration::from_secs(timeout_s),
        wait_for_setpoint(camera, events),
    )
    .await
    .with_context(|| format!("setpoint {} °C not reached in {} s", target, timeout_s))?
}

async fn wait_for_setpoint(camera: &CameraHandle, events: &mut EventStream) -> Result<()> {
    loop {
        let Some(event) = events.recv().await else {
            bail!("camera event stream closed");
        };
        log_event(&event);
        if let DeviceEvent::TemperatureReading { .. } = event {
            if camera.status().await?.cooler.state == RegulationState::Ok {
                return Ok(());
            }
        }
    }
}

fn log_event(event: &DeviceEvent) {
    match event {
        DeviceEvent::ExposureProgress { remaining_s } => {
            tracing::info!(remaining_s, "Exposure in progress");
        }
        DeviceEvent::ExposureDone {
            outcome,
            byte_count,
        } => {
            tracing::info!(?outcome, byte_count, "Exposure done");
        }
        DeviceEvent::TemperatureReading { celsius, state } => {
            tracing::info!(celsius, %state, "Temperature");
        }
        DeviceEvent::CoolerDuty { percent } => {
            tracing::debug!(percent, "Cooler duty");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_expose_with_negative_setpoint() {
        let cli = Cli::try_parse_from([
            "ccd-daemon",
            "--model",
            "fishcamp",
            "expose",
            "--duration",
            "0.5",
            "--frame-type",
            "dark",
            "--cooler-target",
            "-15",
        ])
        .unwrap();
        assert_eq!(cli.model.as_deref(), Some("fishcamp"));
        match cli.command {
            Commands::Expose {
                duration,
                count,
                frame_type,
                cooler_target,
                ..
            } => {
                assert_eq!(duration, 0.5);
                assert_eq!(count, 1);
                assert_eq!(frame_type, FrameType::Dark);
                assert_eq!(cooler_target, Some(-15.0));
            }
            _ => panic!("expected expose"),
        }
    }

    #[test]
    fn test_parse_cool() {
        let cli = Cli::try_parse_from(["ccd-daemon", "cool", "-10", "--timeout", "30"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Cool { target, timeout: 30 } if target == -10.0
        ));
    }
}
