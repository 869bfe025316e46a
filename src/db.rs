//! The database façade
//!
//! Composes the arena, metadata store, and HNSW graph behind one handle and
//! enforces the concurrency discipline: a readers-writer lock gives
//! searches shared access and mutations exclusive access, and an advisory
//! lockfile keeps a second process from opening the same directory for
//! writing.
//!
//! # On-disk layout
//!
//! ```text
//! <dir>/
//!   config.json      creation-time configuration
//!   vectors.bin      mmap vector arena
//!   metadata.jsonl   append-only attribute log
//!   index.hnsw       serialized graph (rewritten on flush/close)
//!   lockfile         advisory write-lock sentinel
//! ```
//!
//! Insert is failure-atomic: writes are sequenced arena → metadata → graph,
//! and a failure after the arena append rolls the arena back before the
//! write guard is released.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use vantage_core::metadata::validate_date;
use vantage_core::simd::{self, l2_norm};
use vantage_core::{
    Filter, GraphStats, Hnsw, MetadataRecord, MetadataStore, Metric, VectorArena, VectorSource,
};

use crate::config::DbConfig;
use crate::error::{DbError, Result};
use crate::lock::DbLock;
use crate::planner::{self, QueryPlan};

const VECTORS_FILE: &str = "vectors.bin";
const METADATA_FILE: &str = "metadata.jsonl";
const GRAPH_FILE: &str = "index.hnsw";
const CONFIG_FILE: &str = "config.json";

/// One search hit: id, metric distance, and the live metadata record.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub id: u32,
    pub distance: f32,
    pub metadata: MetadataRecord,
}

/// Snapshot of database counters.
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    /// Ids ever assigned, tombstoned included.
    pub count: u32,
    pub live_count: usize,
    pub tombstoned_count: usize,
    pub dimension: usize,
    pub metric: Metric,
    /// Bytes on disk across all database files.
    pub bytes: u64,
    #[serde(skip)]
    pub graph: GraphStats,
}

struct DbState {
    arena: VectorArena,
    meta: MetadataStore,
    graph: Hnsw,
    _lock: DbLock,
}

/// An open vector database.
///
/// Cloneable access across threads goes through `Arc<Database>`; all
/// methods take `&self`. `search` and `stats` run under a shared guard,
/// everything that mutates takes the exclusive guard.
pub struct Database {
    config: DbConfig,
    dir: PathBuf,
    inner: RwLock<Option<DbState>>,
    pool: rayon::ThreadPool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("config", &self.config)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Create a new database directory. Fails if one already exists there.
    pub fn create(dir: impl AsRef<Path>, config: DbConfig) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        if dir.join(CONFIG_FILE).exists() {
            return Err(DbError::InvalidArgument(format!(
                "{} already contains a database",
                dir.display()
            )));
        }

        let lock = DbLock::acquire(&dir)?;
        let kernel = simd::select(config.simd_override.to_level());

        let arena = VectorArena::create(
            dir.join(VECTORS_FILE),
            config.dimension as u32,
            config.metric,
            config.seed,
        )?;
        let meta = MetadataStore::create(dir.join(METADATA_FILE))?;
        let graph = Hnsw::new(
            config.hnsw_m,
            config.hnsw_ef_construction,
            config.metric,
            config.seed,
        );
        config.save(&dir.join(CONFIG_FILE))?;

        let pool = build_pool(&config)?;
        info!(
            dir = %dir.display(),
            dimension = config.dimension,
            metric = %config.metric,
            simd = %kernel.level,
            "created database"
        );

        Ok(Self {
            config,
            dir,
            inner: RwLock::new(Some(DbState {
                arena,
                meta,
                graph,
                _lock: lock,
            })),
            pool,
        })
    }

    /// Open an existing database directory.
    ///
    /// The graph file may trail the arena (a crash between `flush` and
    /// `close` loses only graph work); missing links are replayed from the
    /// arena on the way up.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let lock = DbLock::acquire(&dir)?;
        let config = DbConfig::load(&dir.join(CONFIG_FILE))?;
        let kernel = simd::select(config.simd_override.to_level());

        let arena = VectorArena::open(dir.join(VECTORS_FILE))?;
        if arena.dimension() != config.dimension || arena.metric() != config.metric {
            return Err(DbError::Corruption(format!(
                "arena header ({}d, {}) disagrees with config ({}d, {})",
                arena.dimension(),
                arena.metric(),
                config.dimension,
                config.metric
            )));
        }

        let meta = MetadataStore::open(dir.join(METADATA_FILE))?;
        if meta.len() < arena.len() as usize {
            return Err(DbError::Corruption(format!(
                "metadata log has {} records for {} vectors",
                meta.len(),
                arena.len()
            )));
        }

        let graph_path = dir.join(GRAPH_FILE);
        let mut graph = if graph_path.exists() {
            Hnsw::load(&graph_path, config.metric, arena.seed())?
        } else {
            Hnsw::new(
                config.hnsw_m,
                config.hnsw_ef_construction,
                config.metric,
                arena.seed(),
            )
        };

        if graph.len() > arena.len() as usize {
            return Err(DbError::Corruption(format!(
                "graph indexes {} nodes but arena holds {}",
                graph.len(),
                arena.len()
            )));
        }
        let replayed = arena.len() as usize - graph.len();
        for id in graph.len() as u32..arena.len() {
            graph.insert(&arena, id);
        }

        let pool = build_pool(&config)?;
        info!(
            dir = %dir.display(),
            vectors = arena.len(),
            replayed,
            simd = %kernel.level,
            "opened database"
        );

        Ok(Self {
            config,
            dir,
            inner: RwLock::new(Some(DbState {
                arena,
                meta,
                graph,
                _lock: lock,
            })),
            pool,
        })
    }

    /// The configuration the database was created with.
    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    /// Insert a vector with its metadata, returning the assigned id.
    ///
    /// Under the cosine metric the vector is L2-normalized before storage;
    /// the all-zero vector has no direction and is rejected.
    pub fn insert(&self, vector: &[f32], metadata: MetadataRecord) -> Result<u32> {
        let mut inner = self.inner.write();
        let state = open_state_mut(&mut inner)?;
        self.insert_locked(state, vector, metadata)
    }

    /// Insert several vectors under one acquisition of the write guard.
    ///
    /// Elements are committed one at a time; on error the earlier elements
    /// of the batch stay inserted and the failing one is rolled back.
    pub fn insert_batch(&self, items: &[(Vec<f32>, MetadataRecord)]) -> Result<Vec<u32>> {
        let mut inner = self.inner.write();
        let state = open_state_mut(&mut inner)?;

        let mut ids = Vec::with_capacity(items.len());
        for (vector, metadata) in items {
            ids.push(self.insert_locked(state, vector, metadata.clone())?);
        }
        Ok(ids)
    }

    fn insert_locked(
        &self,
        state: &mut DbState,
        vector: &[f32],
        mut metadata: MetadataRecord,
    ) -> Result<u32> {
        if vector.is_empty() {
            return Err(DbError::InvalidArgument("empty vector".into()));
        }
        if vector.len() != self.config.dimension {
            return Err(DbError::InvalidArgument(format!(
                "dimension mismatch: expected {}, got {}",
                self.config.dimension,
                vector.len()
            )));
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(DbError::InvalidArgument(
                "vector contains NaN or infinity".into(),
            ));
        }
        if let Some(date) = &metadata.date {
            validate_date(date)?;
        }

        let stored = self.prepare_vector(vector)?;

        if let Some(cap) = self.config.max_capacity_bytes {
            if state.arena.bytes_after_append() > cap {
                return Err(DbError::Capacity(format!(
                    "arena would exceed {cap} bytes"
                )));
            }
        }

        // Commit order: arena, then metadata, then graph. The graph insert
        // is infallible, so rolling back the arena on a metadata failure is
        // enough to keep the triple consistent.
        let id = state.arena.append(&stored)?;

        metadata.id = id;
        metadata.tombstone = false;
        if let Err(e) = state.meta.append(metadata) {
            state.arena.pop();
            return Err(e.into());
        }

        state.graph.insert(&state.arena, id);
        Ok(id)
    }

    /// Top-k nearest neighbors of `query`, optionally filtered.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&Filter>,
        ef_search: Option<usize>,
    ) -> Result<Vec<SearchResult>> {
        let inner = self.inner.read();
        let state = open_state(&inner)?;

        if k == 0 {
            return Err(DbError::InvalidArgument("k must be positive".into()));
        }
        if query.len() != self.config.dimension {
            return Err(DbError::InvalidArgument(format!(
                "dimension mismatch: expected {}, got {}",
                self.config.dimension,
                query.len()
            )));
        }
        if query.iter().any(|x| !x.is_finite()) {
            return Err(DbError::InvalidArgument(
                "query contains NaN or infinity".into(),
            ));
        }
        if let Some(filter) = filter {
            filter.validate().map_err(DbError::InvalidArgument)?;
        }

        let query = self.prepare_vector(query)?;
        let ef = ef_search.unwrap_or(self.config.hnsw_ef_search_default);

        let hits = match filter {
            None => state
                .graph
                .search(&state.arena, &query, k, ef, |id| state.meta.is_live(id)),

            Some(filter) => {
                let (plan, selectivity) =
                    planner::plan(&state.meta, state.arena.len(), filter, ef);
                debug!(?plan, selectivity, "filtered search");

                match plan {
                    QueryPlan::PreFilter => self.scan_filtered(state, &query, k, filter),
                    QueryPlan::PostFilter { widened_ef } => {
                        let mut hits = state.graph.search(
                            &state.arena,
                            &query,
                            widened_ef,
                            widened_ef,
                            |id| state.meta.matches(id, filter),
                        );
                        hits.truncate(k);
                        hits
                    }
                }
            }
        };

        Ok(hits
            .into_iter()
            .filter_map(|(id, distance)| {
                state.meta.get(id).map(|record| SearchResult {
                    id,
                    distance,
                    metadata: record.clone(),
                })
            })
            .collect())
    }

    /// Brute-force scoring over the ids matching `filter`.
    fn scan_filtered(
        &self,
        state: &DbState,
        query: &[f32],
        k: usize,
        filter: &Filter,
    ) -> Vec<(u32, f32)> {
        let matching: Vec<u32> = (0..state.arena.len())
            .filter(|&id| state.meta.matches(id, filter))
            .collect();

        let metric = self.config.metric;
        let arena = &state.arena;
        let mut scored: Vec<(u32, f32)> = self.pool.install(|| {
            matching
                .par_iter()
                .map(|&id| (id, simd::kernel().distance(metric, query, arena.vector(id))))
                .collect()
        });

        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        scored.truncate(k);
        scored
    }

    /// Fetch a live vector and its metadata by id.
    pub fn get(&self, id: u32) -> Result<(Vec<f32>, MetadataRecord)> {
        let inner = self.inner.read();
        let state = open_state(&inner)?;

        if id >= state.arena.len() || !state.meta.is_live(id) {
            return Err(DbError::NotFound(id));
        }
        let vector = state.arena.get(id)?.to_vec();
        let record = state.meta.get(id).cloned().ok_or(DbError::NotFound(id))?;
        Ok((vector, record))
    }

    /// Replace the metadata for a live id (appends a shadowing record).
    pub fn update_metadata(&self, id: u32, mut metadata: MetadataRecord) -> Result<()> {
        let mut inner = self.inner.write();
        let state = open_state_mut(&mut inner)?;

        if id >= state.arena.len() || !state.meta.is_live(id) {
            return Err(DbError::NotFound(id));
        }
        if let Some(date) = &metadata.date {
            validate_date(date)?;
        }
        metadata.id = id;
        metadata.tombstone = false;
        state.meta.append(metadata)?;
        Ok(())
    }

    /// Logically delete an id. The vector stays in the arena and the graph
    /// topology until the next [`Database::optimize`].
    pub fn tombstone(&self, id: u32) -> Result<()> {
        let mut inner = self.inner.write();
        let state = open_state_mut(&mut inner)?;

        if id >= state.arena.len() {
            return Err(DbError::NotFound(id));
        }
        if !state.meta.tombstone(id)? {
            return Err(DbError::NotFound(id));
        }
        Ok(())
    }

    /// Make all completed writes durable: arena pages, the metadata log,
    /// and a fresh graph snapshot.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.write();
        let state = open_state_mut(&mut inner)?;

        state.arena.flush()?;
        state.meta.flush()?;
        state.graph.save(self.dir.join(GRAPH_FILE))?;
        Ok(())
    }

    /// Rebuild the graph without tombstoned ids and compact the metadata
    /// log, swapping the new files in atomically via rename.
    ///
    /// Ids are preserved: tombstoned rows stay in the arena as dead space
    /// so live offsets never move, but they leave the graph topology.
    pub fn optimize(&self) -> Result<()> {
        let mut inner = self.inner.write();
        let state = open_state_mut(&mut inner)?;

        state.arena.flush()?;
        state.meta.flush()?;

        let n = state.arena.len();
        let mut graph = Hnsw::new(
            self.config.hnsw_m,
            self.config.hnsw_ef_construction,
            self.config.metric,
            state.arena.seed(),
        );
        for id in 0..n {
            if state.meta.is_live(id) {
                graph.insert(&state.arena, id);
            } else {
                graph.insert_unlinked(id);
            }
        }

        let tmp_vectors = self.dir.join("vectors.bin.tmp");
        let tmp_metadata = self.dir.join("metadata.jsonl.tmp");
        let tmp_graph = self.dir.join("index.hnsw.tmp");
        for stale in [&tmp_vectors, &tmp_metadata, &tmp_graph] {
            let _ = std::fs::remove_file(stale);
        }

        let mut new_arena = VectorArena::create(
            &tmp_vectors,
            self.config.dimension as u32,
            self.config.metric,
            state.arena.seed(),
        )?;
        for row in state.arena.iter() {
            new_arena.append(row)?;
        }
        new_arena.seal()?;

        state.meta.compact_to(&tmp_metadata)?;
        graph.save(&tmp_graph)?;

        std::fs::rename(&tmp_vectors, self.dir.join(VECTORS_FILE))?;
        std::fs::rename(&tmp_metadata, self.dir.join(METADATA_FILE))?;
        std::fs::rename(&tmp_graph, self.dir.join(GRAPH_FILE))?;

        state.arena = VectorArena::open(self.dir.join(VECTORS_FILE))?;
        state.meta = MetadataStore::open(self.dir.join(METADATA_FILE))?;
        state.graph = graph;

        info!(
            vectors = n,
            live = state.meta.live_count(),
            "optimized database"
        );
        Ok(())
    }

    /// Current counters. Takes the shared guard.
    pub fn stats(&self) -> Result<DbStats> {
        let inner = self.inner.read();
        let state = open_state(&inner)?;

        let mut bytes = state.arena.file_bytes();
        for name in [METADATA_FILE, GRAPH_FILE, CONFIG_FILE] {
            if let Ok(md) = std::fs::metadata(self.dir.join(name)) {
                bytes += md.len();
            }
        }

        Ok(DbStats {
            count: state.arena.len(),
            live_count: state.meta.live_count(),
            tombstoned_count: state.meta.tombstoned_count(),
            dimension: self.config.dimension,
            metric: self.config.metric,
            bytes,
            graph: state.graph.stats(),
        })
    }

    /// Flush everything, trim the arena to its exact size, and release the
    /// process lock. Idempotent; operations after `close` fail with
    /// `InvalidArgument`.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(mut state) = inner.take() else {
            return Ok(());
        };

        state.meta.flush()?;
        state.graph.save(self.dir.join(GRAPH_FILE))?;

        let DbState { arena, _lock, .. } = state;
        arena.seal()?;
        info!(dir = %self.dir.display(), "closed database");
        drop(_lock);
        Ok(())
    }

    /// Normalize for cosine, pass through for L2.
    fn prepare_vector(&self, vector: &[f32]) -> Result<Vec<f32>> {
        match self.config.metric {
            Metric::Cosine => {
                if l2_norm(vector) <= f32::EPSILON {
                    return Err(DbError::InvalidArgument(
                        "zero vector has no direction under the cosine metric".into(),
                    ));
                }
                Ok(simd::l2_normalized(vector))
            }
            Metric::L2 => Ok(vector.to_vec()),
        }
    }
}

fn open_state<'a>(inner: &'a Option<DbState>) -> Result<&'a DbState> {
    inner
        .as_ref()
        .ok_or_else(|| DbError::InvalidArgument("database is closed".into()))
}

fn open_state_mut<'a>(inner: &'a mut Option<DbState>) -> Result<&'a mut DbState> {
    inner
        .as_mut()
        .ok_or_else(|| DbError::InvalidArgument("database is closed".into()))
}

fn build_pool(config: &DbConfig) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(config.effective_threads())
        .thread_name(|idx| format!("vantage-query-{idx}"))
        .build()
        .map_err(|e| DbError::InvalidArgument(format!("thread pool: {e}")))
}
