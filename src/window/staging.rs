//! Double-buffered staging memory for in-flight layers.
//!
//! Two parallel slots, each a (host buffer, device buffer) pair sized to the
//! largest CPU-tier layer. `active` is the slot compute is consuming;
//! `1 - active` is the prefetch target. Roles swap on every layer advance.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::gpu::backend::{DeviceBuffer, GpuBackend};
use crate::window::manager::WindowError;

/// The two staging pairs, shared with the prefetch worker.
///
/// The worker writes a slot's host buffer under its mutex and then uploads to
/// the paired device buffer; the compute side touches a slot only after
/// observing READY, so host and device halves are never raced.
#[derive(Debug)]
pub struct StagingBuffers {
    host: [Mutex<Vec<u8>>; 2],
    device: [DeviceBuffer; 2],
    slot_len: usize,
    pinned: bool,
}

impl StagingBuffers {
    /// Lock a slot's host buffer.
    pub fn host(&self, slot: usize) -> parking_lot::MutexGuard<'_, Vec<u8>> {
        self.host[slot].lock()
    }

    /// A slot's device buffer.
    pub fn device(&self, slot: usize) -> DeviceBuffer {
        self.device[slot]
    }

    /// Capacity of each slot in bytes.
    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    /// Whether the host halves are pinned allocations.
    pub fn pinned(&self) -> bool {
        self.pinned
    }
}

/// Owns the staging pair and the active-slot rotation.
#[derive(Debug)]
pub struct StagingPool {
    bufs: Arc<StagingBuffers>,
    active: usize,
}

impl StagingPool {
    /// Allocate both staging pairs, each of `slot_len` bytes.
    ///
    /// Host buffers come pinned when the backend offers them; device
    /// allocation failure is fatal to window setup.
    pub fn allocate(backend: &dyn GpuBackend, slot_len: usize) -> Result<Self, WindowError> {
        let mut pinned = true;
        let mut alloc_host = || match backend.alloc_pinned_host(slot_len) {
            Some(buf) => buf,
            None => {
                pinned = false;
                vec![0u8; slot_len]
            }
        };
        let host = [Mutex::new(alloc_host()), Mutex::new(alloc_host())];
        let device = [backend.alloc(slot_len)?, backend.alloc(slot_len)?];

        info!(
            slot_mib = slot_len as f64 / (1024.0 * 1024.0),
            pinned, "Allocated staging buffers (2 host + 2 device)"
        );

        Ok(Self {
            bufs: Arc::new(StagingBuffers {
                host,
                device,
                slot_len,
                pinned,
            }),
            active: 0,
        })
    }

    /// Shared handle for the prefetch worker.
    pub fn buffers(&self) -> Arc<StagingBuffers> {
        Arc::clone(&self.bufs)
    }

    /// Slot compute is currently consuming.
    pub fn active_slot(&self) -> usize {
        self.active
    }

    /// Slot the next load should target.
    pub fn prefetch_slot(&self) -> usize {
        1 - self.active
    }

    /// Swap compute and prefetch roles.
    pub fn flip(&mut self) {
        self.active = 1 - self.active;
    }

    /// Device buffer of a slot.
    pub fn device(&self, slot: usize) -> DeviceBuffer {
        self.bufs.device(slot)
    }

    /// Whether the host halves are pinned.
    pub fn pinned(&self) -> bool {
        self.bufs.pinned
    }

    /// Release both device buffers.
    pub fn free(&self, backend: &dyn GpuBackend) {
        for slot in 0..2 {
            if let Err(e) = backend.free(self.bufs.device(slot)) {
                tracing::warn!(slot, error = %e, "Failed to free staging device buffer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::backend::HostBackend;

    #[test]
    fn test_allocate_and_flip() {
        let backend = HostBackend::new();
        let mut pool = StagingPool::allocate(&backend, 4096).unwrap();

        assert_eq!(pool.active_slot(), 0);
        assert_eq!(pool.prefetch_slot(), 1);
        assert_ne!(pool.device(0).id, pool.device(1).id);
        assert_eq!(pool.buffers().slot_len(), 4096);
        assert!(!pool.pinned());

        pool.flip();
        assert_eq!(pool.active_slot(), 1);
        assert_eq!(pool.prefetch_slot(), 0);
    }

    #[test]
    fn test_allocation_failure_is_error() {
        let backend = HostBackend::with_capacity(1000);
        assert!(StagingPool::allocate(&backend, 4096).is_err());
    }
}
