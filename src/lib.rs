//! VantageDB: an on-disk vector database for journals, charts, and notes
//!
//! Sub-millisecond top-k similarity search over up to ~10⁶ embedding
//! vectors with attribute filtering, crash-safe persistence, and concurrent
//! read access.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │            Database façade (RwLock, lockfile, planner)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    HNSW Indexing Engine                     │
//! │         Hierarchical Navigable Small World Graph            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │        VectorArena (mmap) · MetadataStore (jsonl)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use vantage_db::{Database, DbConfig, DocType, Filter, MetadataRecord, Metric};
//!
//! let config = DbConfig::new(384).metric(Metric::Cosine).seed(42);
//! let db = Database::create("./journal.vdb", config)?;
//!
//! let entry = MetadataRecord::new(DocType::Journal, "notes/2024-03-15-es.md")
//!     .with_date("2024-03-15")
//!     .with_asset_tag("ES");
//! let id = db.insert(&vec![0.1; 384], entry)?;
//!
//! let hits = db.search(
//!     &vec![0.1; 384],
//!     10,
//!     Some(&Filter::doc_type(DocType::Journal)),
//!     None,
//! )?;
//! assert_eq!(hits[0].id, id);
//! db.close()?;
//! # Ok::<(), vantage_db::DbError>(())
//! ```

pub mod config;
pub mod db;
pub mod error;
mod lock;
pub mod planner;
pub mod telemetry;

pub use config::{DbConfig, SimdOverride};
pub use db::{Database, DbStats, SearchResult};
pub use error::{DbError, Result};

// Core types a caller needs to build records and filters.
pub use vantage_core::{
    Bias, DocType, Filter, GraphStats, MetadataRecord, Metric, NumericOp, SimdLevel,
};
