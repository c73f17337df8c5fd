//! Per-layer transfer states shared between the compute thread and the
//! prefetch worker.
//!
//! The READY store uses Release ordering and every read uses Acquire, so a
//! READY observation happens-after the worker's writes into the staging
//! buffers.

use std::sync::atomic::{AtomicU8, Ordering};

/// Where a layer is in its staging transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Not in transfer.
    Idle,
    /// Load in flight.
    Loading,
    /// Data available at the target; safe to consume.
    Ready,
}

const IDLE: u8 = 0;
const LOADING: u8 = 1;
const READY: u8 = 2;

fn decode(raw: u8) -> TransferState {
    match raw {
        LOADING => TransferState::Loading,
        READY => TransferState::Ready,
        _ => TransferState::Idle,
    }
}

/// One atomic transfer state per layer.
#[derive(Debug)]
pub struct LayerStates {
    states: Vec<AtomicU8>,
}

impl LayerStates {
    pub fn new(n_layer: usize) -> Self {
        Self {
            states: (0..n_layer).map(|_| AtomicU8::new(IDLE)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, il: usize) -> TransferState {
        decode(self.states[il].load(Ordering::Acquire))
    }

    /// IDLE → LOADING, claiming the load. False when the layer is already
    /// loading or ready.
    pub fn try_begin_load(&self, il: usize) -> bool {
        self.states[il]
            .compare_exchange(IDLE, LOADING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Publish a completed transfer. Pairs with the Acquire in [`get`].
    pub fn set_ready(&self, il: usize) {
        self.states[il].store(READY, Ordering::Release);
    }

    /// Return a layer to IDLE (swap-back or failed load).
    pub fn set_idle(&self, il: usize) {
        self.states[il].store(IDLE, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_transitions() {
        let states = LayerStates::new(3);
        assert_eq!(states.get(1), TransferState::Idle);

        assert!(states.try_begin_load(1));
        assert_eq!(states.get(1), TransferState::Loading);
        // Second claim on the same layer loses.
        assert!(!states.try_begin_load(1));

        states.set_ready(1);
        assert_eq!(states.get(1), TransferState::Ready);
        assert!(!states.try_begin_load(1));

        states.set_idle(1);
        assert!(states.try_begin_load(1));
    }
}
