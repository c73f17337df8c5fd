//! llm-paging: paged KV-cache blocks and tiered layer windowing.
//!
//! Two independent cores extracted from an LLM inference runtime:
//!
//! - A block-based KV cache: fixed-size physical blocks with a ref-counted
//!   free list ([`cache::allocator`]) and a per-sequence logical→physical
//!   mapping with copy-on-write sharing ([`cache::table`]).
//! - A sliding layer window that keeps model weight layers spread across
//!   GPU / CPU / disk tiers and rotates CPU-tier layers through a pair of
//!   GPU staging buffers by rebinding tensor data pointers
//!   ([`window::manager`]), backed by a disk byte-range index with a bounded
//!   CPU cache ([`transfer::disk`]) and a background prefetch worker
//!   ([`transfer::loader`]).

pub mod cache;
pub mod config;
pub mod gpu;
pub mod model;
pub mod transfer;
pub mod window;
