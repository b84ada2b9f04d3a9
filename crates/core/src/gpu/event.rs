use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

/// Monotonic counter shared between the GPU queue and the accelerator worker.
///
/// One domain signals a value once its work up to that point is complete, the
/// other waits until the counter reaches that value before touching the
/// shared buffers.
#[derive(Clone)]
pub struct SharedEvent {
    inner: Arc<EventInner>,
}

struct EventInner {
    label: String,
    value: Mutex<u64>,
    changed: Condvar,
}

impl SharedEvent {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventInner {
                label: label.into(),
                value: Mutex::new(0),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn signaled_value(&self) -> u64 {
        *self
            .inner
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Raises the counter to `value`. Lower values are ignored.
    pub fn signal(&self, value: u64) {
        let mut current = self
            .inner
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if value > *current {
            *current = value;
            self.inner.changed.notify_all();
        }
    }

    /// Blocks until the counter is at least `value`.
    pub fn wait_for(&self, value: u64) {
        let mut current = self
            .inner
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while *current < value {
            current = self
                .inner
                .changed
                .wait(current)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

impl fmt::Debug for SharedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedEvent")
            .field("label", &self.inner.label)
            .field("value", &self.signaled_value())
            .finish()
    }
}

/// One-shot result slot filled by a worker and awaited by the caller.
pub(crate) struct Completion<T> {
    slot: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> Completion<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    /// Stores the result unless one is already present.
    pub(crate) fn complete(&self, value: T) {
        let mut slot = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            *slot = Some(value);
            self.ready.notify_all();
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    pub(crate) fn wait(&self) -> T {
        let mut slot = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            slot = self
                .ready
                .wait(slot)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}
