//! Frame buffer for single-exposure readout.
//!
//! One buffer per device, sized for the current geometry plus a fixed overhead
//! the vendor SDK may write past the pixel data. The buffer is reallocated only
//! when the required size changes, never appended to.
//!
//! # Locking
//!
//! The buffer lives behind an `Arc<parking_lot::Mutex<_>>`:
//!
//! - The readout thread takes an owned guard with [`FrameBufferManager::acquire_for_write`]
//!   and holds it for the whole `read_frame` call. Dropping the guard releases it
//!   on every exit path.
//! - Everything else uses `try_lock` and fails fast instead of waiting on a
//!   transfer: resizing returns `GeometryMismatch`, reads return `BufferBusy`.

use ccd_core::error::{CameraError, CameraResult};
use ccd_core::geometry::FrameGeometry;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::sync::Arc;

/// Raw image memory plus the metadata of the last frame written into it.
#[derive(Debug)]
pub struct FrameBuffer {
    // === Pixel Data ===
    data: Vec<u8>,
    /// Bytes written by the last successful readout (0 when no valid frame).
    valid_len: usize,

    // === Frame Identity ===
    geometry: FrameGeometry,
    /// Incremented on every committed readout.
    frame_number: u64,
}

impl FrameBuffer {
    /// Allocated size in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Geometry the buffer is sized for.
    #[must_use]
    pub fn geometry(&self) -> &FrameGeometry {
        &self.geometry
    }

    /// Bytes of the last frame.
    #[must_use]
    pub fn valid_len(&self) -> usize {
        self.valid_len
    }

    /// Number of frames committed since the buffer was created.
    #[must_use]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Valid frame bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data[..self.valid_len]
    }
}

/// Copy of the last frame taken out of the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSnapshot {
    /// Frame bytes as delivered by the hardware.
    pub data: Vec<u8>,
    /// Geometry the frame was captured with.
    pub geometry: FrameGeometry,
    /// Frame counter at capture time.
    pub frame_number: u64,
}

/// Write access to the buffer for one readout.
///
/// Owned, so it can be moved into a blocking task. Dropping the guard without
/// calling [`commit`](Self::commit) leaves the buffer without a valid frame.
pub struct FrameWriteGuard {
    guard: ArcMutexGuard<RawMutex, FrameBuffer>,
}

impl FrameWriteGuard {
    /// Whole allocation, for the hardware to write into.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.guard.data
    }

    /// Mark `bytes` as a valid frame and advance the frame counter.
    ///
    /// Returns the committed length (clamped to the buffer size).
    pub fn commit(mut self, bytes: usize) -> usize {
        let len = bytes.min(self.guard.data.len());
        self.guard.valid_len = len;
        self.guard.frame_number += 1;
        len
    }
}

impl std::fmt::Debug for FrameWriteGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriteGuard")
            .field("capacity", &self.guard.data.len())
            .finish()
    }
}

/// Shared handle to a device's frame buffer.
#[derive(Debug, Clone)]
pub struct FrameBufferManager {
    inner: Arc<Mutex<FrameBuffer>>,
    overhead: usize,
}

impl FrameBufferManager {
    /// Allocate a buffer for `geometry` with `overhead` trailing bytes.
    pub fn new(geometry: &FrameGeometry, overhead: usize) -> CameraResult<Self> {
        let size = geometry.buffer_bytes(overhead)?;
        tracing::debug!(size, "Allocating frame buffer");
        Ok(Self {
            inner: Arc::new(Mutex::new(FrameBuffer {
                data: vec![0; size],
                valid_len: 0,
                geometry: *geometry,
                frame_number: 0,
            })),
            overhead,
        })
    }

    /// Size the buffer for a new geometry.
    ///
    /// Reallocates only when the byte size changes; returns whether it did.
    /// Fails with `GeometryMismatch` while a readout holds the buffer.
    pub fn resize(&self, geometry: &FrameGeometry) -> CameraResult<bool> {
        let mut buffer = self.inner.try_lock().ok_or_else(|| {
            CameraError::GeometryMismatch("frame buffer is held by a readout".into())
        })?;
        let size = geometry.buffer_bytes(self.overhead)?;
        buffer.geometry = *geometry;
        if buffer.data.len() == size {
            return Ok(false);
        }
        tracing::debug!(old = buffer.data.len(), new = size, "Reallocating frame buffer");
        buffer.data = vec![0; size];
        buffer.valid_len = 0;
        Ok(true)
    }

    /// Check that the buffer is sized for `geometry` and not in use.
    pub fn check_geometry(&self, geometry: &FrameGeometry) -> CameraResult<()> {
        let buffer = self.inner.try_lock().ok_or(CameraError::BufferBusy)?;
        let expected = geometry.buffer_bytes(self.overhead)?;
        if buffer.geometry != *geometry || buffer.data.len() != expected {
            return Err(CameraError::GeometryMismatch(format!(
                "buffer holds {} bytes for {}x{}, geometry needs {} bytes for {}x{}",
                buffer.data.len(),
                buffer.geometry.binned_width(),
                buffer.geometry.binned_height(),
                expected,
                geometry.binned_width(),
                geometry.binned_height()
            )));
        }
        Ok(())
    }

    /// Take the buffer for a readout, blocking until it is free.
    ///
    /// Invalidates the previous frame. Call from a blocking context only.
    #[must_use]
    pub fn acquire_for_write(&self) -> FrameWriteGuard {
        let mut guard = self.inner.lock_arc();
        guard.valid_len = 0;
        FrameWriteGuard { guard }
    }

    /// Run `f` on the buffer. `BufferBusy` while a readout holds it.
    pub fn with_frame<R>(&self, f: impl FnOnce(&FrameBuffer) -> R) -> CameraResult<R> {
        let buffer = self.inner.try_lock().ok_or(CameraError::BufferBusy)?;
        Ok(f(&buffer))
    }

    /// Copy out the last frame, if one is valid.
    pub fn read_frame(&self) -> CameraResult<Option<FrameSnapshot>> {
        self.with_frame(|buffer| {
            (buffer.valid_len > 0).then(|| FrameSnapshot {
                data: buffer.data().to_vec(),
                geometry: buffer.geometry,
                frame_number: buffer.frame_number,
            })
        })
    }

    /// Whether a readout currently holds the buffer.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}
