//! GPU device discovery and information.
//!
//! Real deployments query the accelerator runtime for this inventory; the
//! crate only consumes the resulting list, so tests and CPU-only builds work
//! from stub inventories.

use serde::{Deserialize, Serialize};
use tracing::info;

/// What kind of processor a device is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Cpu,
    Gpu,
    /// Integrated GPU sharing host memory.
    Igpu,
}

/// Information about a single device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device kind.
    pub kind: DeviceKind,

    /// Device name (e.g., "NVIDIA GeForce RTX 3090").
    pub name: String,

    /// Free memory in bytes at detection time.
    pub free_bytes: usize,

    /// Total memory in bytes.
    pub total_bytes: usize,
}

impl DeviceInfo {
    /// Whether this device contributes to the GPU tier budget.
    pub fn is_accelerator(&self) -> bool {
        matches!(self.kind, DeviceKind::Gpu | DeviceKind::Igpu)
    }
}

/// Detect available devices.
///
/// Without an accelerator runtime compiled in, this reports an empty
/// inventory (CPU-only mode); callers then fall back to stub inventories or
/// configuration.
pub fn detect_devices() -> Vec<DeviceInfo> {
    info!("No accelerator runtime compiled in, reporting empty device inventory");
    Vec::new()
}

/// Build a stub GPU entry for tests and CPU-only runs.
pub fn stub_gpu(name: &str, free_bytes: usize, total_bytes: usize) -> DeviceInfo {
    DeviceInfo {
        kind: DeviceKind::Gpu,
        name: name.to_string(),
        free_bytes,
        total_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_gpu() {
        let dev = stub_gpu("Test GPU", 7 << 30, 8 << 30);
        assert!(dev.is_accelerator());
        assert_eq!(dev.free_bytes, 7 << 30);
    }

    #[test]
    fn test_cpu_not_accelerator() {
        let dev = DeviceInfo {
            kind: DeviceKind::Cpu,
            name: "host".to_string(),
            free_bytes: 16 << 30,
            total_bytes: 32 << 30,
        };
        assert!(!dev.is_accelerator());
    }
}
