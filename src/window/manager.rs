//! The layer window manager.
//!
//! Keeps per-layer tier assignments and rotates CPU/disk-tier layers through
//! the double-buffered staging pair so the layer about to be computed is
//! already resident on the accelerator. Movement rebinds each tensor
//! descriptor's `data`/`buffer` fields in place; descriptor identities are
//! never replaced, so a pre-compiled compute graph stays valid.
//!
//! Typical decode-loop choreography, with layer `i` active in one slot:
//!
//! 1. `request_layer(j)` for the next windowed layer `j` — the worker loads
//!    it into the idle slot while `i` computes.
//! 2. After `i` finishes: `swap_layer_to_cpu(i)`, `wait_ready(j)`,
//!    `flip_active()`, `swap_layer_to_gpu(j)`, compute `j`.

use std::ops::Range;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::WindowConfig;
use crate::gpu::backend::{BackendError, BufferId, GpuBackend};
use crate::gpu::device::DeviceInfo;
use crate::model::{LayerWeights, WeightSource};
use crate::transfer::disk::DiskStore;
use crate::transfer::loader::{stage_layer, LoadError, LoaderContext, PrefetchLoader};
use crate::window::staging::StagingPool;
use crate::window::state::{LayerStates, TransferState};

/// Storage class of a layer's weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerTier {
    /// Permanently resident on the accelerator.
    Gpu,
    /// Host RAM, windowed into GPU staging as needed.
    Cpu,
    /// On disk, paged in on demand.
    Disk,
}

impl std::fmt::Display for LayerTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerTier::Gpu => write!(f, "GPU"),
            LayerTier::Cpu => write!(f, "CPU"),
            LayerTier::Disk => write!(f, "DISK"),
        }
    }
}

/// Original pointer fields of one tensor, kept for swap-back.
#[derive(Debug, Clone, Copy)]
struct SavedPtr {
    tensor_idx: usize,
    data: usize,
    buffer: BufferId,
}

/// Per-layer bookkeeping.
#[derive(Debug)]
pub struct LayerEntry {
    il: usize,
    tier: LayerTier,
    weight_bytes: usize,

    /// Staging slot holding this layer, `None` when not staged.
    staging_slot: Option<usize>,

    /// Saved pointer triples; non-empty exactly while staged.
    saved_ptrs: Vec<SavedPtr>,
}

impl LayerEntry {
    fn new(il: usize) -> Self {
        Self {
            il,
            tier: LayerTier::Cpu,
            weight_bytes: 0,
            staging_slot: None,
            saved_ptrs: Vec::new(),
        }
    }

    pub fn il(&self) -> usize {
        self.il
    }

    pub fn tier(&self) -> LayerTier {
        self.tier
    }

    pub fn weight_bytes(&self) -> usize {
        self.weight_bytes
    }

    pub fn staging_slot(&self) -> Option<usize> {
        self.staging_slot
    }
}

#[derive(Error, Debug)]
pub enum WindowError {
    #[error("layer {0} out of range")]
    LayerOutOfRange(usize),

    #[error("staging buffers not allocated")]
    StagingNotAllocated,

    #[error("staging allocation failed: {0}")]
    StagingAllocFailed(#[from] BackendError),

    #[error("window not connected to a weight source and backend")]
    NotConnected,

    #[error("failed to start prefetch worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    #[error(transparent)]
    Load(#[from] LoadError),
}

/// Sliding-window manager for layer weights across GPU / CPU / disk tiers.
pub struct LayerWindow {
    params: WindowConfig,

    n_layer: usize,
    n_window: usize,
    n_gpu_static: usize,

    entries: Vec<LayerEntry>,
    states: Arc<LayerStates>,

    staging: Option<StagingPool>,
    disk: Option<Arc<DiskStore>>,
    ctx: Option<LoaderContext>,
    loader: Option<PrefetchLoader>,
}

impl LayerWindow {
    /// Create entries for `n_layer` layers, all CPU-tier and idle.
    pub fn new(params: WindowConfig, n_layer: usize) -> Self {
        Self {
            params,
            n_layer,
            n_window: 0,
            n_gpu_static: 0,
            entries: (0..n_layer).map(LayerEntry::new).collect(),
            states: Arc::new(LayerStates::new(n_layer)),
            staging: None,
            disk: None,
            ctx: None,
            loader: None,
        }
    }

    /// Fill per-layer weight sizes from the model's tensor descriptors.
    pub fn compute_layer_sizes(&mut self, layers: &[LayerWeights]) {
        for (il, layer) in layers.iter().enumerate().take(self.n_layer) {
            self.entries[il].weight_bytes = layer.weight_bytes();
        }
    }

    /// Classify every layer into GPU / CPU / DISK.
    ///
    /// Free bytes are summed across accelerator devices; both budgets keep a
    /// safety margin back. Layers are assigned from the last to the first,
    /// since output-side layers benefit most from permanent GPU residence.
    pub fn auto_detect_tiers(&mut self, devices: &[DeviceInfo], cpu_available: usize) {
        let gpu_free: usize = devices
            .iter()
            .filter(|d| d.is_accelerator())
            .map(|d| d.free_bytes)
            .sum();

        let margin = self.params.safety_margin;
        let mut gpu_budget = gpu_free.saturating_sub(margin);
        let mut cpu_budget = cpu_available.saturating_sub(margin);

        let (mut n_gpu, mut n_cpu, mut n_disk) = (0usize, 0usize, 0usize);

        for il in (0..self.n_layer).rev() {
            let bytes = self.entries[il].weight_bytes;
            if bytes <= gpu_budget {
                self.entries[il].tier = LayerTier::Gpu;
                gpu_budget -= bytes;
                n_gpu += 1;
                // GPU-tier layers never transfer; they are ready forever.
                self.states.set_ready(il);
            } else if bytes <= cpu_budget {
                self.entries[il].tier = LayerTier::Cpu;
                cpu_budget -= bytes;
                n_cpu += 1;
            } else {
                self.entries[il].tier = LayerTier::Disk;
                n_disk += 1;
            }
        }

        self.n_gpu_static = n_gpu;
        info!(n_gpu, n_cpu, n_disk, "Tier assignment complete");
    }

    /// Auto-size the window from free VRAM after the KV cache, activations,
    /// and the safety margin are spoken for. Each windowed layer needs both
    /// staging pairs' worth of room, hence the factor 2.
    ///
    /// Returns 0 (windowing disabled) when VRAM is too small; that is a
    /// degraded mode, not an error.
    pub fn auto_detect_window(
        &mut self,
        free_vram: usize,
        kv_cache_size: usize,
        activation_size: usize,
    ) -> usize {
        let reserved = kv_cache_size + activation_size + self.params.safety_margin;

        if free_vram <= reserved {
            warn!(
                free_vram,
                reserved, "Free VRAM under reservation, disabling layer window"
            );
            self.n_window = 0;
            return 0;
        }
        let available = free_vram - reserved;

        let (max_layer, n_cpu) = self.cpu_tier_extent();
        if max_layer == 0 || n_cpu == 0 {
            self.n_window = 0;
            return 0;
        }

        let n = (available / (2 * max_layer)).max(1).min(n_cpu);
        self.n_window = n;

        info!(
            n_window = n,
            available_mib = available as f64 / (1024.0 * 1024.0),
            max_layer_mib = max_layer as f64 / (1024.0 * 1024.0),
            n_cpu,
            "Auto-detected window size"
        );
        n
    }

    /// Resolve the configured window size: auto (-1), disabled (0), or a
    /// manual count clamped to the CPU-tier layer count.
    pub fn resolve_window(
        &mut self,
        free_vram: usize,
        kv_cache_size: usize,
        activation_size: usize,
    ) -> usize {
        match self.params.n_window {
            n if n < 0 => self.auto_detect_window(free_vram, kv_cache_size, activation_size),
            0 => {
                self.n_window = 0;
                0
            }
            n => {
                let (_, n_cpu) = self.cpu_tier_extent();
                self.n_window = (n as usize).min(n_cpu);
                self.n_window
            }
        }
    }

    fn cpu_tier_extent(&self) -> (usize, usize) {
        let mut max_layer = 0usize;
        let mut n_cpu = 0usize;
        for e in &self.entries {
            if e.tier == LayerTier::Cpu {
                max_layer = max_layer.max(e.weight_bytes);
                n_cpu += 1;
            }
        }
        (max_layer, n_cpu)
    }

    /// Allocate the two staging pairs, each sized to the largest CPU-tier
    /// layer. Failure here is fatal to windowed operation.
    pub fn allocate_staging_buffers(&mut self, backend: &dyn GpuBackend) -> Result<(), WindowError> {
        let (max_layer, _) = self.cpu_tier_extent();
        if max_layer == 0 {
            warn!("No CPU-tier layers, skipping staging allocation");
            return Ok(());
        }

        self.staging = Some(StagingPool::allocate(backend, max_layer)?);
        Ok(())
    }

    /// Attach the disk tier serving DISK-tier layers.
    pub fn attach_disk(&mut self, store: DiskStore) {
        self.disk = Some(Arc::new(store));
    }

    /// Wire up the weight source and backend, and start the prefetch worker
    /// when prefetching is enabled. Call after tiers are resolved and staging
    /// is allocated.
    pub fn connect(
        &mut self,
        source: Arc<dyn WeightSource>,
        backend: Arc<dyn GpuBackend>,
    ) -> Result<(), WindowError> {
        let staging = self.staging.as_ref().ok_or(WindowError::StagingNotAllocated)?;

        let ctx = LoaderContext {
            staging: staging.buffers(),
            states: Arc::clone(&self.states),
            backend,
            source,
            disk: self.disk.clone(),
            tiers: self.entries.iter().map(LayerEntry::tier).collect(),
            sizes: self.entries.iter().map(LayerEntry::weight_bytes).collect(),
        };

        if self.params.prefetch_enabled {
            self.loader = Some(PrefetchLoader::spawn(ctx.clone())?);
        }
        self.ctx = Some(ctx);
        Ok(())
    }

    /// Whether windowing is active at all.
    pub fn enabled(&self) -> bool {
        self.n_window > 0 && self.n_window < self.n_layer
    }

    /// Half-open layer range that should be accelerator-resident while
    /// computing `current_il`. Centered and clamped; the full model when
    /// windowing is disabled.
    pub fn window_range(&self, current_il: usize) -> Range<usize> {
        if !self.enabled() {
            return 0..self.n_layer;
        }

        let half = self.n_window / 2;
        if current_il < half {
            return 0..self.n_window.min(self.n_layer);
        }

        let start = current_il - half;
        let end = start + self.n_window;
        if end > self.n_layer {
            let end = self.n_layer;
            return end.saturating_sub(self.n_window)..end;
        }
        start..end
    }

    /// True when layer `il`'s weights are readable by GPU kernels right now.
    pub fn is_on_gpu(&self, il: usize) -> bool {
        self.entries.get(il).is_some_and(|e| {
            e.tier == LayerTier::Gpu || e.staging_slot.is_some()
        })
    }

    /// Kick off a load of layer `il` into the idle staging slot.
    ///
    /// Returns `Ok(false)` when there is nothing to do: permanently resident,
    /// already staged, or already loading/ready. With prefetching disabled
    /// the load happens inline on the caller's thread.
    pub fn request_layer(&mut self, il: usize) -> Result<bool, WindowError> {
        if il >= self.n_layer {
            return Err(WindowError::LayerOutOfRange(il));
        }

        let entry = &self.entries[il];
        if entry.tier == LayerTier::Gpu || entry.staging_slot.is_some() {
            return Ok(false);
        }

        let staging = self.staging.as_ref().ok_or(WindowError::StagingNotAllocated)?;
        let ctx = self.ctx.as_ref().ok_or(WindowError::NotConnected)?;

        if !self.states.try_begin_load(il) {
            return Ok(false);
        }
        let slot = staging.prefetch_slot();

        if let Some(loader) = &self.loader {
            if loader.submit(il, slot) {
                Ok(true)
            } else {
                self.states.set_idle(il);
                Ok(false)
            }
        } else {
            match stage_layer(ctx, il, slot) {
                Ok(()) => Ok(true),
                Err(e) => {
                    self.states.set_idle(il);
                    Err(e.into())
                }
            }
        }
    }

    /// Whether layer `il`'s transfer has completed.
    pub fn poll_ready(&self, il: usize) -> bool {
        match self.entries.get(il) {
            Some(e) if e.tier == LayerTier::Gpu => true,
            Some(_) => self.states.get(il) == TransferState::Ready,
            None => false,
        }
    }

    /// Block until layer `il` is ready to consume.
    ///
    /// The caller must have a load in flight for `il`; there are no internal
    /// timeouts.
    pub fn wait_ready(&self, il: usize) {
        while !self.poll_ready(il) {
            std::thread::yield_now();
        }
    }

    /// Current transfer state of a layer.
    pub fn transfer_state(&self, il: usize) -> TransferState {
        if il < self.states.len() {
            self.states.get(il)
        } else {
            TransferState::Idle
        }
    }

    /// Swap compute and prefetch staging roles after a layer advance.
    pub fn flip_active(&mut self) {
        if let Some(staging) = &mut self.staging {
            staging.flip();
        }
    }

    /// Rebind layer `il`'s tensors into the active staging slot.
    ///
    /// Only the `data`/`buffer` fields of each descriptor change; the
    /// descriptors themselves stay where the graph expects them. Original
    /// pointers are saved for [`swap_layer_to_cpu`]. No-op for GPU-tier or
    /// already-staged layers.
    pub fn swap_layer_to_gpu(
        &mut self,
        il: usize,
        layer: &mut LayerWeights,
    ) -> Result<(), WindowError> {
        if il >= self.n_layer {
            return Err(WindowError::LayerOutOfRange(il));
        }
        if self.entries[il].tier == LayerTier::Gpu || self.entries[il].staging_slot.is_some() {
            return Ok(());
        }

        let staging = self.staging.as_ref().ok_or(WindowError::StagingNotAllocated)?;
        let slot = staging.active_slot();
        let dev = staging.device(slot);

        let entry = &mut self.entries[il];
        entry.staging_slot = Some(slot);
        entry.saved_ptrs.clear();

        let mut offset = 0usize;
        for (idx, t) in layer.tensors.iter_mut().enumerate() {
            entry.saved_ptrs.push(SavedPtr {
                tensor_idx: idx,
                data: t.data,
                buffer: t.buffer,
            });
            t.data = dev.base + offset;
            t.buffer = dev.id;
            offset += t.nbytes;
        }
        debug_assert!(offset <= dev.len, "layer exceeds staging slot");

        debug!(il, slot, nbytes = offset, "Swapped layer to GPU staging");
        Ok(())
    }

    /// Restore layer `il`'s tensors to their saved host pointers and release
    /// its staging slot. No-op for GPU-tier or unstaged layers.
    pub fn swap_layer_to_cpu(
        &mut self,
        il: usize,
        layer: &mut LayerWeights,
    ) -> Result<(), WindowError> {
        if il >= self.n_layer {
            return Err(WindowError::LayerOutOfRange(il));
        }

        let entry = &mut self.entries[il];
        if entry.tier == LayerTier::Gpu || entry.staging_slot.is_none() {
            return Ok(());
        }

        for sp in entry.saved_ptrs.drain(..) {
            let t = &mut layer.tensors[sp.tensor_idx];
            t.data = sp.data;
            t.buffer = sp.buffer;
        }
        entry.staging_slot = None;
        self.states.set_idle(il);

        debug!(il, "Swapped layer back to CPU");
        Ok(())
    }

    /// Per-layer bookkeeping entry.
    pub fn entry(&self, il: usize) -> Option<&LayerEntry> {
        self.entries.get(il)
    }

    /// Device buffer backing a staging slot, once staging is allocated.
    pub fn staging_device(&self, slot: usize) -> Option<crate::gpu::backend::DeviceBuffer> {
        self.staging.as_ref().map(|s| s.device(slot))
    }

    pub fn n_layer(&self) -> usize {
        self.n_layer
    }

    /// Resolved window size in layers (0 when disabled).
    pub fn n_window(&self) -> usize {
        self.n_window
    }

    /// Layers permanently resident on the accelerator.
    pub fn n_gpu_static(&self) -> usize {
        self.n_gpu_static
    }

    /// Whether staging host buffers are pinned allocations.
    pub fn use_pinned(&self) -> bool {
        self.staging.as_ref().is_some_and(StagingPool::pinned)
    }

    /// Stop the worker, free staging device memory, and drop the disk cache.
    pub fn shutdown(&mut self, backend: &dyn GpuBackend) {
        if let Some(mut loader) = self.loader.take() {
            loader.stop();
        }
        self.ctx = None;

        if let Some(staging) = self.staging.take() {
            staging.free(backend);
        }

        if let Some(disk) = self.disk.take() {
            match Arc::try_unwrap(disk) {
                Ok(mut store) => store.free_cache(),
                Err(_) => warn!("Disk store still shared at shutdown, cache not freed"),
            }
        }

        self.entries.clear();
        self.n_layer = 0;
        self.n_window = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::stub_gpu;

    const MIB: usize = 1 << 20;

    fn window_with_layers(n_layer: usize, bytes_per_layer: usize) -> LayerWindow {
        let mut w = LayerWindow::new(WindowConfig::default(), n_layer);
        for il in 0..n_layer {
            w.entries[il].weight_bytes = bytes_per_layer;
        }
        w
    }

    #[test]
    fn test_window_range_centering() {
        let mut w = window_with_layers(40, MIB);
        w.n_window = 8;

        assert_eq!(w.window_range(20), 16..24);
        assert_eq!(w.window_range(2), 0..8);
        assert_eq!(w.window_range(39), 32..40);
    }

    #[test]
    fn test_window_range_disabled() {
        let w = window_with_layers(40, MIB);
        assert!(!w.enabled());
        assert_eq!(w.window_range(20), 0..40);
    }

    #[test]
    fn test_tier_greedy_assignment() {
        // 32 layers at 200 MiB; budgets of 1 GiB GPU and 2 GiB CPU after the
        // margin: last 5 fit on GPU, next 10 on CPU, remaining 17 on disk.
        let mut w = window_with_layers(32, 200 * MIB);
        let margin = w.params.safety_margin;
        let devices = [stub_gpu("test", 1024 * MIB + margin, 8192 * MIB)];

        w.auto_detect_tiers(&devices, 2048 * MIB + margin);

        assert_eq!(w.n_gpu_static(), 5);
        for il in 27..32 {
            assert_eq!(w.entry(il).unwrap().tier(), LayerTier::Gpu);
            assert!(w.poll_ready(il));
        }
        for il in 17..27 {
            assert_eq!(w.entry(il).unwrap().tier(), LayerTier::Cpu);
        }
        for il in 0..17 {
            assert_eq!(w.entry(il).unwrap().tier(), LayerTier::Disk);
        }
    }

    #[test]
    fn test_auto_detect_window_sizing() {
        let mut w = window_with_layers(32, 200 * MIB);
        let margin = w.params.safety_margin;
        w.auto_detect_tiers(&[stub_gpu("t", margin, 0)], 8 * 1024 * MIB + margin);

        // All 32 layers land on CPU. 1600 MiB free after reservation fits
        // 1600 / (2*200) = 4 windowed layers.
        let n = w.auto_detect_window(1600 * MIB + margin, 0, 0);
        assert_eq!(n, 4);
        assert!(w.enabled());
    }

    #[test]
    fn test_auto_detect_window_vram_too_small() {
        let mut w = window_with_layers(8, 100 * MIB);
        let n = w.auto_detect_window(64 * MIB, 0, 0);
        assert_eq!(n, 0);
        assert!(!w.enabled());
    }

    #[test]
    fn test_resolve_manual_window_clamped() {
        let mut w = window_with_layers(8, 100 * MIB);
        w.params.n_window = 6;
        let margin = w.params.safety_margin;
        // 4 CPU-tier layers only.
        w.auto_detect_tiers(&[stub_gpu("t", margin, 0)], 400 * MIB + margin);

        assert_eq!(w.resolve_window(0, 0, 0), 4);

        w.params.n_window = 0;
        assert_eq!(w.resolve_window(0, 0, 0), 0);
    }
}
