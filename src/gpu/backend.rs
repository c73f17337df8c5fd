//! Device buffer backend.
//!
//! The window never owns real VRAM; it asks a [`GpuBackend`] for device
//! buffers and base addresses and hands copies to it. [`HostBackend`] is the
//! accelerator-less implementation that keeps every "device" buffer in host
//! memory under a fake device address, which is enough for CPU-only runs and
//! for tests to read staged bytes back.

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

/// Opaque handle naming one device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// A device-side buffer: handle, base address, and length.
///
/// `base` is the address compute kernels use; tensor data pointers rebinded
/// into this buffer always land inside `[base, base + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBuffer {
    pub id: BufferId,
    pub base: usize,
    pub len: usize,
}

impl DeviceBuffer {
    /// Whether an address lies inside this buffer.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.len
    }
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("out of device memory allocating {nbytes} bytes")]
    OutOfMemory { nbytes: usize },

    #[error("unknown device buffer {0:?}")]
    UnknownBuffer(BufferId),

    #[error("upload of {needed} bytes exceeds buffer of {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

/// Allocates device buffers and copies host data into them.
pub trait GpuBackend: Send + Sync {
    /// Allocate a device buffer of `nbytes`.
    fn alloc(&self, nbytes: usize) -> Result<DeviceBuffer, BackendError>;

    /// Release a device buffer.
    fn free(&self, buf: DeviceBuffer) -> Result<(), BackendError>;

    /// Copy `data` to the start of `dst` (host→device).
    fn upload(&self, dst: &DeviceBuffer, data: &[u8]) -> Result<(), BackendError>;

    /// Allocate a pinned host buffer when the backend supports it.
    ///
    /// Pinned memory makes host→device copies cheaper; backends without it
    /// return `None` and callers fall back to pageable memory.
    fn alloc_pinned_host(&self, nbytes: usize) -> Option<Vec<u8>> {
        let _ = nbytes;
        None
    }
}

#[derive(Default)]
struct HostBackendState {
    next_id: u64,
    next_base: usize,
    buffers: HashMap<BufferId, Vec<u8>>,
}

/// Host-memory stand-in for a real accelerator backend.
pub struct HostBackend {
    state: Mutex<HostBackendState>,

    /// Optional cap on total allocated bytes, to exercise OOM paths.
    capacity: Option<usize>,
}

impl HostBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostBackendState {
                next_id: 1,
                // Fake device address space starts well away from zero.
                next_base: 0x1000_0000,
                buffers: HashMap::new(),
            }),
            capacity: None,
        }
    }

    /// Backend that refuses allocations once `capacity` bytes are live.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new()
        }
    }

    /// Read back a buffer's contents (testing aid).
    pub fn read(&self, buf: &DeviceBuffer) -> Result<Vec<u8>, BackendError> {
        let state = self.state.lock();
        state
            .buffers
            .get(&buf.id)
            .cloned()
            .ok_or(BackendError::UnknownBuffer(buf.id))
    }

    /// Bytes currently allocated.
    pub fn allocated_bytes(&self) -> usize {
        self.state.lock().buffers.values().map(Vec::len).sum()
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuBackend for HostBackend {
    fn alloc(&self, nbytes: usize) -> Result<DeviceBuffer, BackendError> {
        let mut state = self.state.lock();

        if let Some(cap) = self.capacity {
            let live: usize = state.buffers.values().map(Vec::len).sum();
            if live + nbytes > cap {
                return Err(BackendError::OutOfMemory { nbytes });
            }
        }

        let id = BufferId(state.next_id);
        state.next_id += 1;

        let base = state.next_base;
        // Keep fake address ranges disjoint and page-aligned.
        state.next_base += nbytes.next_multiple_of(4096);

        state.buffers.insert(id, vec![0u8; nbytes]);
        debug!(id = id.0, base, nbytes, "Allocated device buffer");

        Ok(DeviceBuffer {
            id,
            base,
            len: nbytes,
        })
    }

    fn free(&self, buf: DeviceBuffer) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state
            .buffers
            .remove(&buf.id)
            .ok_or(BackendError::UnknownBuffer(buf.id))?;
        debug!(id = buf.id.0, "Freed device buffer");
        Ok(())
    }

    fn upload(&self, dst: &DeviceBuffer, data: &[u8]) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let backing = state
            .buffers
            .get_mut(&dst.id)
            .ok_or(BackendError::UnknownBuffer(dst.id))?;

        if data.len() > backing.len() {
            return Err(BackendError::BufferTooSmall {
                needed: data.len(),
                available: backing.len(),
            });
        }

        backing[..data.len()].copy_from_slice(data);
        Ok(())
    }
}
