//! Runtime configuration for llm-paging.
//!
//! Configuration can be loaded from a JSON file or constructed
//! programmatically. All sizing knobs (block size, cell counts, staging and
//! cache budgets) live here.

use serde::{Deserialize, Serialize};

/// Default VRAM safety margin reserved before any budget math: 256 MiB.
pub const DEFAULT_SAFETY_MARGIN: usize = 256 << 20;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Paged KV cache settings.
    pub cache: CacheConfig,

    /// Layer window settings.
    pub window: WindowConfig,
}

/// Paged KV cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Total KV cells in the physical pool.
    pub total_cells: usize,

    /// Tokens per block (8, 16, 32, ...).
    pub block_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            total_cells: 32768,
            block_size: 32,
        }
    }
}

impl CacheConfig {
    /// Number of physical blocks the pool holds.
    pub fn num_blocks(&self) -> usize {
        if self.block_size == 0 {
            return 0;
        }
        self.total_cells / self.block_size
    }
}

/// Layer window settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Window size in layers: -1 = auto-detect, 0 = disabled, >0 = manual.
    pub n_window: i32,

    /// Run the background prefetch worker.
    pub prefetch_enabled: bool,

    /// Byte budget for the disk tier's CPU-side layer cache.
    pub cpu_cache_budget: usize,

    /// VRAM reserved before budgeting layers into GPU memory.
    pub safety_margin: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            n_window: -1,
            prefetch_enabled: true,
            cpu_cache_budget: 4 * 1024 * 1024 * 1024, // 4 GB
            safety_margin: DEFAULT_SAFETY_MARGIN,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.cache.block_size, 32);
        assert_eq!(cfg.window.n_window, -1);
        assert!(cfg.window.prefetch_enabled);
        assert_eq!(cfg.window.safety_margin, 256 << 20);
    }

    #[test]
    fn test_num_blocks() {
        let cfg = CacheConfig {
            total_cells: 128,
            block_size: 32,
        };
        assert_eq!(cfg.num_blocks(), 4);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let cfg = Config::load(std::path::Path::new("/nonexistent/llm-paging.json")).unwrap();
        assert_eq!(cfg.cache.num_blocks(), 32768 / 32);
    }
}
