//! Background prefetch worker.
//!
//! One long-lived thread consumes `(layer, staging slot)` requests from a
//! bounded queue, reads the layer's weight bytes (RAM source or disk tier)
//! into the slot's host buffer, uploads them to the paired device buffer, and
//! publishes READY. A shutdown sentinel plus a shared stop flag terminate the
//! worker after the in-flight request finishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use thiserror::Error;
use tracing::{debug, warn};

use crate::gpu::backend::{BackendError, GpuBackend};
use crate::model::WeightSource;
use crate::transfer::disk::{DiskError, DiskStore};
use crate::window::manager::LayerTier;
use crate::window::staging::StagingBuffers;
use crate::window::state::LayerStates;

/// Pending requests the queue holds before `submit` starts refusing.
const QUEUE_CAPACITY: usize = 4;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Disk(#[from] DiskError),

    #[error("weight source error: {0}")]
    Source(#[from] std::io::Error),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("layer {0} is disk-tier but no disk store is attached")]
    NoDiskStore(usize),
}

/// Everything a load needs, shared between the worker and the window's
/// synchronous fallback path.
#[derive(Clone)]
pub(crate) struct LoaderContext {
    pub staging: Arc<StagingBuffers>,
    pub states: Arc<LayerStates>,
    pub backend: Arc<dyn GpuBackend>,
    pub source: Arc<dyn WeightSource>,
    pub disk: Option<Arc<DiskStore>>,

    /// Tier per layer, fixed once tiers are detected.
    pub tiers: Vec<LayerTier>,

    /// Weight bytes per layer.
    pub sizes: Vec<usize>,
}

/// Stage one layer into a staging slot and publish READY.
pub(crate) fn stage_layer(ctx: &LoaderContext, il: usize, slot: usize) -> Result<(), LoadError> {
    let nbytes = ctx.sizes[il];

    if nbytes > ctx.staging.slot_len() {
        return Err(LoadError::Backend(BackendError::BufferTooSmall {
            needed: nbytes,
            available: ctx.staging.slot_len(),
        }));
    }

    match ctx.tiers[il] {
        // Permanently resident; nothing to stage.
        LayerTier::Gpu => return Ok(()),
        LayerTier::Cpu => {
            let mut host = ctx.staging.host(slot);
            ctx.source.read_layer(il, &mut host[..nbytes])?;
            ctx.backend
                .upload(&ctx.staging.device(slot), &host[..nbytes])?;
        }
        LayerTier::Disk => {
            let disk = ctx.disk.as_ref().ok_or(LoadError::NoDiskStore(il))?;
            let mut host = ctx.staging.host(slot);
            disk.read_layer(il, &mut host[..nbytes])?;
            ctx.backend
                .upload(&ctx.staging.device(slot), &host[..nbytes])?;
        }
    }

    ctx.states.set_ready(il);
    debug!(il, slot, nbytes, "Staged layer");
    Ok(())
}

enum Request {
    Load { il: usize, slot: usize },
    Shutdown,
}

/// Handle to the background worker: bounded queue in, join on stop.
pub struct PrefetchLoader {
    tx: SyncSender<Request>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PrefetchLoader {
    pub(crate) fn spawn(ctx: LoaderContext) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::sync_channel(QUEUE_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("layer-prefetch".to_string())
            .spawn(move || worker_loop(ctx, rx, worker_stop))?;

        Ok(Self {
            tx,
            stop,
            handle: Some(handle),
        })
    }

    /// Queue a load of layer `il` into staging slot `slot`.
    ///
    /// Non-blocking: a full (or disconnected) queue refuses the request and
    /// the caller rolls the layer's state back.
    pub fn submit(&self, il: usize, slot: usize) -> bool {
        match self.tx.try_send(Request::Load { il, slot }) {
            Ok(()) => true,
            Err(_) => {
                warn!(il, slot, "Prefetch queue refused request");
                false
            }
        }
    }

    /// Signal shutdown and join the worker. Idempotent; the worker finishes
    /// its in-flight request first.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.tx.try_send(Request::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PrefetchLoader {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(ctx: LoaderContext, rx: Receiver<Request>, stop: Arc<AtomicBool>) {
    for req in rx.iter() {
        if stop.load(Ordering::Acquire) {
            break;
        }

        match req {
            Request::Shutdown => break,
            Request::Load { il, slot } => {
                if let Err(e) = stage_layer(&ctx, il, slot) {
                    // Load failures leave the layer's data undefined for this
                    // pass; callers must observe READY before scheduling it.
                    warn!(il, slot, error = %e, "Layer load failed");
                    ctx.states.set_idle(il);
                }
            }
        }
    }
    debug!("Prefetch worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::backend::HostBackend;
    use crate::model::HostWeights;
    use crate::window::staging::StagingPool;
    use crate::window::state::TransferState;

    fn test_ctx(payload: Vec<u8>) -> (LoaderContext, Arc<HostBackend>, StagingPool) {
        let backend = Arc::new(HostBackend::new());
        let pool = StagingPool::allocate(backend.as_ref(), 64).unwrap();
        let nbytes = payload.len();
        let ctx = LoaderContext {
            staging: pool.buffers(),
            states: Arc::new(LayerStates::new(1)),
            backend: backend.clone(),
            source: Arc::new(HostWeights::new(vec![payload])),
            disk: None,
            tiers: vec![LayerTier::Cpu],
            sizes: vec![nbytes],
        };
        (ctx, backend, pool)
    }

    #[test]
    fn test_stage_layer_uploads_and_publishes() {
        let (ctx, backend, pool) = test_ctx(vec![9u8; 48]);

        assert!(ctx.states.try_begin_load(0));
        stage_layer(&ctx, 0, 1).unwrap();

        assert_eq!(ctx.states.get(0), TransferState::Ready);
        let staged = backend.read(&pool.device(1)).unwrap();
        assert_eq!(&staged[..48], &[9u8; 48][..]);
    }

    #[test]
    fn test_worker_loads_via_queue() {
        let (ctx, backend, pool) = test_ctx(vec![3u8; 16]);
        let states = Arc::clone(&ctx.states);

        let mut loader = PrefetchLoader::spawn(ctx).unwrap();
        assert!(states.try_begin_load(0));
        assert!(loader.submit(0, 0));

        while states.get(0) != TransferState::Ready {
            std::thread::yield_now();
        }
        let staged = backend.read(&pool.device(0)).unwrap();
        assert_eq!(&staged[..16], &[3u8; 16][..]);

        loader.stop();
        // Stopped loader refuses further work.
        assert!(!loader.submit(0, 1));
    }
}
