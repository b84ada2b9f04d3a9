//! Compute device abstraction used by the pipeline.
//!
//! [`Device`] hands out textures, shared tensor buffers, command queues and
//! shared events. The shipped device executes compute passes on the CPU with
//! rayon ([`kernels`]) behind an in-order queue worker, which gives the
//! pipeline a real second execution domain to order against.

mod event;
pub mod kernels;
mod queue;
mod texture;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

pub(crate) use event::Completion;
pub use event::SharedEvent;
pub use kernels::UpsampleFilter;
pub use queue::{CommandQueue, CommandStream, Submission};
pub use texture::{Extent, Texture, TextureDescriptor, TextureFormat};

use crate::buffer::{SharedBuffer, SurfaceHandle};
use crate::model::TensorLayout;

#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    name: String,
    next_id: AtomicU64,
}

impl Device {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        debug!(device = %name, "Creating compute device");
        Self {
            inner: Arc::new(DeviceInner {
                name,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// The rayon-backed reference device.
    pub fn cpu_reference() -> Self {
        Self::new("cpu-reference")
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn create_texture(&self, descriptor: &TextureDescriptor) -> Texture {
        Texture::new(self.next_id(), descriptor)
    }

    /// Allocates a zero-filled buffer visible to both the GPU and the accelerator.
    pub fn create_shared_buffer(&self, label: impl Into<String>, layout: TensorLayout) -> SharedBuffer {
        SharedBuffer::new(SurfaceHandle::new(self.next_id()), label, layout)
    }

    pub fn create_command_queue(&self, label: impl Into<String>) -> CommandQueue {
        CommandQueue::new(format!("{}.{}", self.inner.name, label.into()))
    }

    pub fn create_event(&self, label: impl Into<String>) -> SharedEvent {
        SharedEvent::new(label)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.inner.name)
            .finish()
    }
}
