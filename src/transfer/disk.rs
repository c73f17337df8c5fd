//! Disk tier: byte-range layer reads plus a bounded CPU-side cache.
//!
//! Each DISK-tier layer is described by an ordered list of `(file_offset,
//! len)` spans; concatenating the spans reproduces the layer's raw weight
//! payload. Reads are positional so concurrent loads never share file-pointer
//! state. Fetched layers park in a CPU cache capped at `cpu_cache_budget`
//! bytes with LRU eviction.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// Positional read interface over the model file.
///
/// Implementations must not mutate shared state per read, so the loader can
/// issue overlapping reads safely.
pub trait ModelFile: Send + Sync {
    /// Read up to `dst.len()` bytes at `offset`, returning the count read.
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> std::io::Result<usize>;
}

#[cfg(unix)]
impl ModelFile for std::fs::File {
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> std::io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, dst, offset)
    }
}

#[cfg(windows)]
impl ModelFile for std::fs::File {
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> std::io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, dst, offset)
    }
}

/// One contiguous byte range of a layer's payload in the model file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerSpan {
    pub offset: u64,
    pub len: u64,
}

#[derive(Error, Debug)]
pub enum DiskError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("short read for layer {il}: expected {expected} bytes, got {got}")]
    ShortRead { il: usize, expected: u64, got: u64 },

    #[error("layer {0} has no disk index")]
    UnknownLayer(usize),
}

/// Counters mirrored out of the disk tier.
#[derive(Debug, Default, Clone)]
pub struct DiskStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub bytes_read: u64,
    pub evictions: u64,
}

#[derive(Debug)]
struct CacheEntry {
    il: usize,
    data: Vec<u8>,
    last_access: u64,
}

#[derive(Debug, Default)]
struct CpuCache {
    entries: Vec<CacheEntry>,
    total_bytes: usize,
    /// Monotonic access clock; orders eviction and tags fetched entries.
    access_counter: u64,
}

impl CpuCache {
    fn touch(&mut self) -> u64 {
        self.access_counter += 1;
        self.access_counter
    }
}

/// The disk tier: file handle, per-layer span index, bounded CPU cache.
pub struct DiskStore {
    file: Box<dyn ModelFile>,

    /// Per-layer spans; concatenation order is payload order.
    spans: Vec<Vec<LayerSpan>>,

    cache: Mutex<CpuCache>,
    cpu_cache_budget: usize,

    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    bytes_read: AtomicU64,
    evictions: AtomicU64,
}

impl DiskStore {
    /// Build a store over `file` with one span list per layer.
    pub fn new(file: Box<dyn ModelFile>, spans: Vec<Vec<LayerSpan>>, cpu_cache_budget: usize) -> Self {
        Self {
            file,
            spans,
            cache: Mutex::new(CpuCache::default()),
            cpu_cache_budget,
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Number of indexed layers.
    pub fn n_layers(&self) -> usize {
        self.spans.len()
    }

    /// Payload size of a layer in bytes.
    pub fn layer_nbytes(&self, il: usize) -> u64 {
        self.spans
            .get(il)
            .map_or(0, |s| s.iter().map(|r| r.len).sum())
    }

    /// Read a layer's payload through the CPU cache into `dst`.
    pub fn read_layer(&self, il: usize, dst: &mut [u8]) -> Result<(), DiskError> {
        let nbytes = self.layer_nbytes(il) as usize;

        {
            let mut cache = self.cache.lock();
            let clock = cache.touch();
            if let Some(entry) = cache.entries.iter_mut().find(|e| e.il == il) {
                entry.last_access = clock;
                dst[..entry.data.len()].copy_from_slice(&entry.data);
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let mut data = vec![0u8; nbytes];
        self.load_layer_from_disk(il, &mut data)?;
        dst[..nbytes].copy_from_slice(&data);

        let mut cache = self.cache.lock();
        let clock = cache.touch();
        cache.total_bytes += data.len();
        cache.entries.push(CacheEntry {
            il,
            data,
            last_access: clock,
        });
        self.evict_lru(&mut cache);

        Ok(())
    }

    /// Read a layer's spans straight from the file, bypassing the cache.
    pub fn load_layer_from_disk(&self, il: usize, dst: &mut [u8]) -> Result<(), DiskError> {
        let spans = self.spans.get(il).ok_or(DiskError::UnknownLayer(il))?;

        let mut write_offset = 0usize;
        for span in spans {
            let len = span.len as usize;
            let buf = &mut dst[write_offset..write_offset + len];
            read_exact_at(self.file.as_ref(), span.offset, buf).map_err(|e| match e {
                ReadExactError::Short(got) => DiskError::ShortRead {
                    il,
                    expected: span.len,
                    got,
                },
                ReadExactError::Io(e) => DiskError::Io(e),
            })?;
            write_offset += len;
        }

        self.bytes_read
            .fetch_add(write_offset as u64, Ordering::Relaxed);
        debug!(il, nbytes = write_offset, "Loaded layer from disk");
        Ok(())
    }

    /// Evict least-recently-used entries until the cache fits its budget.
    /// Ties on `last_access` keep insertion order (stable sort).
    fn evict_lru(&self, cache: &mut CpuCache) {
        if cache.total_bytes <= self.cpu_cache_budget {
            return;
        }

        cache.entries.sort_by_key(|e| e.last_access);

        while cache.total_bytes > self.cpu_cache_budget && !cache.entries.is_empty() {
            let oldest = cache.entries.remove(0);
            cache.total_bytes -= oldest.data.len();
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(
                il = oldest.il,
                nbytes = oldest.data.len(),
                remaining = cache.total_bytes,
                "Evicted cached layer"
            );
        }
    }

    /// Bytes currently held in the CPU cache.
    pub fn cached_bytes(&self) -> usize {
        self.cache.lock().total_bytes
    }

    /// Whether a layer is resident in the CPU cache.
    pub fn is_cached(&self, il: usize) -> bool {
        self.cache.lock().entries.iter().any(|e| e.il == il)
    }

    /// Drop every cached buffer and the span index.
    pub fn free_cache(&mut self) {
        let mut cache = self.cache.lock();
        let dropped = cache.entries.len();
        cache.entries.clear();
        cache.total_bytes = 0;
        drop(cache);

        self.spans.clear();
        if dropped > 0 {
            warn!(dropped, "Cleared disk-tier CPU cache");
        }
    }

    /// Snapshot of the tier's counters.
    pub fn stats(&self) -> DiskStats {
        DiskStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

enum ReadExactError {
    Short(u64),
    Io(std::io::Error),
}

/// Positional read that fills `dst` completely or reports how far it got.
fn read_exact_at(file: &dyn ModelFile, offset: u64, dst: &mut [u8]) -> Result<(), ReadExactError> {
    let mut filled = 0usize;
    while filled < dst.len() {
        match file.read_at(offset + filled as u64, &mut dst[filled..]) {
            Ok(0) => return Err(ReadExactError::Short(filled as u64)),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ReadExactError::Io(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn store_with_file(payload: &[u8], spans: Vec<Vec<LayerSpan>>, budget: usize) -> DiskStore {
        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(payload).unwrap();
        DiskStore::new(Box::new(tmp), spans, budget)
    }

    #[test]
    fn test_span_concatenation() {
        // Layer 0 = bytes [4..8) ++ [0..2), out of file order on purpose.
        let store = store_with_file(
            &[10, 11, 12, 13, 20, 21, 22, 23],
            vec![vec![
                LayerSpan { offset: 4, len: 4 },
                LayerSpan { offset: 0, len: 2 },
            ]],
            1024,
        );

        let mut dst = vec![0u8; 6];
        store.load_layer_from_disk(0, &mut dst).unwrap();
        assert_eq!(dst, vec![20, 21, 22, 23, 10, 11]);
        assert_eq!(store.stats().bytes_read, 6);
    }

    #[test]
    fn test_short_read_reported() {
        // Span runs past end of file.
        let store = store_with_file(
            &[1, 2, 3],
            vec![vec![LayerSpan { offset: 0, len: 8 }]],
            1024,
        );

        let mut dst = vec![0u8; 8];
        match store.load_layer_from_disk(0, &mut dst) {
            Err(DiskError::ShortRead { il: 0, expected: 8, got }) => assert_eq!(got, 3),
            other => panic!("expected short read, got {other:?}"),
        }
    }

    #[test]
    fn test_cache_hit_and_eviction() {
        // Three 4-byte layers, budget fits two.
        let spans = (0..3)
            .map(|i| {
                vec![LayerSpan {
                    offset: i * 4,
                    len: 4,
                }]
            })
            .collect();
        let store = store_with_file(&[0xAA; 12], spans, 8);

        let mut dst = vec![0u8; 4];
        store.read_layer(0, &mut dst).unwrap();
        store.read_layer(1, &mut dst).unwrap();
        assert_eq!(store.cached_bytes(), 8);

        // Hit on layer 0 refreshes it; loading layer 2 then evicts layer 1.
        store.read_layer(0, &mut dst).unwrap();
        store.read_layer(2, &mut dst).unwrap();

        assert_eq!(store.cached_bytes(), 8);
        assert!(store.is_cached(0));
        assert!(!store.is_cached(1));
        assert!(store.is_cached(2));

        let stats = store.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 3);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn test_free_cache() {
        let store = store_with_file(
            &[0u8; 4],
            vec![vec![LayerSpan { offset: 0, len: 4 }]],
            1024,
        );
        let mut dst = vec![0u8; 4];
        store.read_layer(0, &mut dst).unwrap();
        assert_eq!(store.cached_bytes(), 4);

        let mut store = store;
        store.free_cache();
        assert_eq!(store.cached_bytes(), 0);
        assert_eq!(store.n_layers(), 0);
    }
}
