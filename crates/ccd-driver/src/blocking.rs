//! Vendor calls off the async worker threads.
//!
//! `HardwareChannel` methods block inside the vendor SDK. Everything in this
//! crate that runs on the runtime (the device actor, the start task) reaches
//! the hardware through [`call`], which moves the call onto Tokio's blocking
//! pool and awaits its result.

use ccd_core::error::{HardwareError, HwResult};
use ccd_core::hardware::HardwareChannel;
use std::sync::Arc;

/// Run one hardware call on the blocking pool.
///
/// A panic inside the call surfaces as a `HardwareError` for `operation`.
pub(crate) async fn call<T, F>(
    hardware: &Arc<dyn HardwareChannel>,
    operation: &'static str,
    f: F,
) -> HwResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn HardwareChannel) -> HwResult<T> + Send + 'static,
{
    let hardware = Arc::clone(hardware);
    match tokio::task::spawn_blocking(move || f(hardware.as_ref())).await {
        Ok(result) => result,
        Err(err) => Err(HardwareError::new(
            operation,
            format!("blocking task failed: {}", err),
        )),
    }
}
