//! Database configuration
//!
//! The envelope applied at `create` and persisted as `config.json` in the
//! database directory, so `open` never needs parameters. Environment
//! variables (`VDB_SIMD`, `VDB_NUM_THREADS`) override individual fields at
//! runtime without touching the persisted copy.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use vantage_core::{Metric, SimdLevel};

use crate::error::{DbError, Result};

/// Kernel selection policy. `Auto` probes the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SimdOverride {
    #[default]
    Auto,
    Avx512,
    Avx2,
    Scalar,
}

impl SimdOverride {
    pub(crate) fn to_level(self) -> Option<SimdLevel> {
        match self {
            SimdOverride::Auto => None,
            SimdOverride::Avx512 => Some(SimdLevel::Avx512),
            SimdOverride::Avx2 => Some(SimdLevel::Avx2),
            SimdOverride::Scalar => Some(SimdLevel::Scalar),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// Vector dimension, fixed for the database's lifetime.
    pub dimension: usize,

    /// Distance metric, fixed at creation.
    pub metric: Metric,

    /// HNSW max neighbors per node above layer 0.
    pub hnsw_m: usize,

    /// Beam width while building the graph.
    pub hnsw_ef_construction: usize,

    /// Beam width for searches that don't pass one explicitly.
    pub hnsw_ef_search_default: usize,

    /// Soft capacity hint; sizing only, never enforced.
    pub max_elements: usize,

    /// Kernel selection. `VDB_SIMD` takes precedence at runtime.
    pub simd_override: SimdOverride,

    /// Worker threads for brute-force scoring and rebuilds. 0 = CPU count.
    pub thread_pool_size: usize,

    /// Seed for HNSW layer assignment. Fixing it makes builds reproducible.
    pub seed: u64,

    /// Optional hard cap on the arena file size in bytes. Inserts that
    /// would grow past it fail with a capacity error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_capacity_bytes: Option<u64>,
}

impl DbConfig {
    /// A config with defaults for everything but the dimension. The seed is
    /// derived from the wall clock; set one explicitly for reproducibility.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            metric: Metric::Cosine,
            hnsw_m: 16,
            hnsw_ef_construction: 200,
            hnsw_ef_search_default: 50,
            max_elements: 1_000_000,
            simd_override: SimdOverride::Auto,
            thread_pool_size: 0,
            seed: clock_seed(),
            max_capacity_bytes: None,
        }
    }

    pub fn metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    pub fn hnsw_m(mut self, m: usize) -> Self {
        self.hnsw_m = m;
        self
    }

    pub fn hnsw_ef_construction(mut self, ef: usize) -> Self {
        self.hnsw_ef_construction = ef;
        self
    }

    pub fn hnsw_ef_search_default(mut self, ef: usize) -> Self {
        self.hnsw_ef_search_default = ef;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn simd_override(mut self, level: SimdOverride) -> Self {
        self.simd_override = level;
        self
    }

    pub fn thread_pool_size(mut self, threads: usize) -> Self {
        self.thread_pool_size = threads;
        self
    }

    pub fn max_capacity_bytes(mut self, bytes: u64) -> Self {
        self.max_capacity_bytes = Some(bytes);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(DbError::InvalidArgument("dimension must be positive".into()));
        }
        if self.hnsw_m < 2 {
            return Err(DbError::InvalidArgument("hnsw_m must be at least 2".into()));
        }
        if self.hnsw_ef_construction == 0 || self.hnsw_ef_search_default == 0 {
            return Err(DbError::InvalidArgument(
                "ef parameters must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Thread pool width after applying the `VDB_NUM_THREADS` override.
    pub(crate) fn effective_threads(&self) -> usize {
        std::env::var("VDB_NUM_THREADS")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(self.thread_pool_size)
    }

    pub(crate) fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| DbError::InvalidArgument(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub(crate) fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| DbError::Corruption(format!("config.json: {e}")))
    }
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_values() {
        let config = DbConfig::new(128);
        assert_eq!(config.metric, Metric::Cosine);
        assert_eq!(config.hnsw_m, 16);
        assert_eq!(config.hnsw_ef_construction, 200);
        assert_eq!(config.hnsw_ef_search_default, 50);
        assert_eq!(config.max_elements, 1_000_000);
        assert_eq!(config.simd_override, SimdOverride::Auto);
        assert_eq!(config.thread_pool_size, 0);
    }

    #[test]
    fn validation_rejects_degenerate_values() {
        assert!(DbConfig::new(0).validate().is_err());
        assert!(DbConfig::new(8).hnsw_m(1).validate().is_err());
        assert!(DbConfig::new(8).hnsw_ef_construction(0).validate().is_err());
        assert!(DbConfig::new(8).validate().is_ok());
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = DbConfig::new(64)
            .metric(Metric::L2)
            .hnsw_m(12)
            .seed(99)
            .max_capacity_bytes(1 << 30);
        config.save(&path).unwrap();

        let loaded = DbConfig::load(&path).unwrap();
        assert_eq!(loaded.dimension, 64);
        assert_eq!(loaded.metric, Metric::L2);
        assert_eq!(loaded.hnsw_m, 12);
        assert_eq!(loaded.seed, 99);
        assert_eq!(loaded.max_capacity_bytes, Some(1 << 30));
    }
}
