//! Tensor memory shared between the GPU and the neural accelerator.
//!
//! A [`SharedBuffer`] owns exactly one surface. Accelerator-side access is
//! bracketed by the scoped guard returned from [`SharedBuffer::lock`]; GPU
//! passes go through [`SharedBuffer::gpu_read`] / [`SharedBuffer::gpu_write`],
//! which refuse to touch the surface while an accelerator guard is live.
//! The two access paths are kept apart in time by the upscaler's fences; the
//! buffer only detects violations.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use half::f16;
use tracing::trace;

use crate::error::{GpuError, ProcessError};
use crate::model::{TensorLayout, TENSOR_ELEMENT_SIZE};

/// Opaque identity of a platform surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(u64);

impl SurfaceHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SurfaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface#{}", self.0)
    }
}

struct Surface {
    handle: SurfaceHandle,
    label: String,
    layout: TensorLayout,
    data: Mutex<Vec<u8>>,
    accelerator_access: AtomicBool,
}

impl Surface {
    fn data(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        trace!(
            surface = %self.handle,
            label = %self.label,
            bytes = self.layout.length,
            "Releasing shared surface"
        );
    }
}

/// Cheap, clonable handle to one shared tensor surface.
///
/// The surface is released when the last handle is dropped.
#[derive(Clone)]
pub struct SharedBuffer {
    surface: Arc<Surface>,
}

impl SharedBuffer {
    pub(crate) fn new(handle: SurfaceHandle, label: impl Into<String>, layout: TensorLayout) -> Self {
        let label = label.into();
        trace!(surface = %handle, label = %label, bytes = layout.length, "Allocating shared surface");
        Self {
            surface: Arc::new(Surface {
                handle,
                label,
                layout,
                data: Mutex::new(vec![0; layout.length]),
                accelerator_access: AtomicBool::new(false),
            }),
        }
    }

    pub fn handle(&self) -> SurfaceHandle {
        self.surface.handle
    }

    pub fn label(&self) -> &str {
        &self.surface.label
    }

    pub fn layout(&self) -> &TensorLayout {
        &self.surface.layout
    }

    pub fn pixel_stride(&self) -> usize {
        self.surface.layout.pixel_stride
    }

    pub fn row_stride(&self) -> usize {
        self.surface.layout.row_stride
    }

    pub fn length(&self) -> usize {
        self.surface.layout.length
    }

    pub fn same_surface(&self, other: &SharedBuffer) -> bool {
        Arc::ptr_eq(&self.surface, &other.surface)
    }

    pub fn downgrade(&self) -> WeakSharedBuffer {
        WeakSharedBuffer {
            surface: Arc::downgrade(&self.surface),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.surface.accelerator_access.load(Ordering::Acquire)
    }

    /// Begins accelerator-side access. The access ends when the guard drops.
    pub fn lock(&self) -> Result<AcceleratorAccess<'_>, ProcessError> {
        if self
            .surface
            .accelerator_access
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ProcessError::BufferBusy(self.surface.handle));
        }
        trace!(surface = %self.surface.handle, "Accelerator access begin");
        Ok(AcceleratorAccess {
            data: self.surface.data(),
            surface: &self.surface,
        })
    }

    /// Runs `f` over the surface bytes from the GPU domain.
    pub fn gpu_read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, GpuError> {
        self.ensure_gpu_accessible()?;
        let data = self.surface.data();
        Ok(f(&data))
    }

    /// Runs `f` over the mutable surface bytes from the GPU domain.
    pub fn gpu_write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, GpuError> {
        self.ensure_gpu_accessible()?;
        let mut data = self.surface.data();
        Ok(f(&mut data))
    }

    /// Copies `bytes` into the surface at `offset`.
    pub fn gpu_write_at(&self, offset: usize, bytes: &[u8]) -> Result<(), GpuError> {
        let capacity = self.length();
        if offset.checked_add(bytes.len()).map_or(true, |end| end > capacity) {
            return Err(GpuError::OutOfBounds {
                offset,
                len: bytes.len(),
                capacity,
            });
        }
        self.gpu_write(|data| data[offset..offset + bytes.len()].copy_from_slice(bytes))
    }

    /// Copy of the surface contents, read through the GPU path.
    pub fn snapshot(&self) -> Result<Vec<u8>, GpuError> {
        self.gpu_read(|data| data.to_vec())
    }

    fn ensure_gpu_accessible(&self) -> Result<(), GpuError> {
        if self.is_locked() {
            Err(GpuError::SurfaceBusy(self.surface.handle))
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("handle", &self.surface.handle)
            .field("label", &self.surface.label)
            .field("layout", &self.surface.layout)
            .finish()
    }
}

/// Non-owning reference used to observe surface release.
#[derive(Clone)]
pub struct WeakSharedBuffer {
    surface: Weak<Surface>,
}

impl WeakSharedBuffer {
    pub fn upgrade(&self) -> Option<SharedBuffer> {
        self.surface.upgrade().map(|surface| SharedBuffer { surface })
    }

    pub fn is_released(&self) -> bool {
        self.surface.strong_count() == 0
    }
}

/// Scoped accelerator-side access to a [`SharedBuffer`].
pub struct AcceleratorAccess<'a> {
    data: MutexGuard<'a, Vec<u8>>,
    surface: &'a Surface,
}

impl AcceleratorAccess<'_> {
    pub fn handle(&self) -> SurfaceHandle {
        self.surface.handle
    }

    pub fn layout(&self) -> &TensorLayout {
        &self.surface.layout
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn slot_bytes(&self, slot: usize) -> &[u8] {
        let stride = self.surface.layout.slot_stride;
        &self.data[slot * stride..(slot + 1) * stride]
    }

    pub fn read_f16(&self, offset: usize) -> f16 {
        f16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }

    pub fn write_f16(&mut self, offset: usize, value: f16) {
        self.data[offset..offset + TENSOR_ELEMENT_SIZE].copy_from_slice(&value.to_le_bytes());
    }

    /// Element at (`slot`, `x`, `y`, `channel`) as `f32`.
    pub fn element(&self, slot: usize, x: usize, y: usize, channel: usize) -> f32 {
        self.read_f16(self.surface.layout.offset(slot, x, y, channel))
            .to_f32()
    }

    pub fn set_element(&mut self, slot: usize, x: usize, y: usize, channel: usize, value: f32) {
        let offset = self.surface.layout.offset(slot, x, y, channel);
        self.write_f16(offset, f16::from_f32(value));
    }
}

impl Drop for AcceleratorAccess<'_> {
    fn drop(&mut self) {
        self.surface
            .accelerator_access
            .store(false, Ordering::Release);
        trace!(surface = %self.surface.handle, "Accelerator access end");
    }
}
