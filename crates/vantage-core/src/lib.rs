//! Vantage Core – mmap vector arena, HNSW index, SIMD distance kernels, and
//! attribute metadata for VantageDB
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     HNSW Indexing Engine                    │
//! │        ANN search · emit-gated traversal · serialization    │
//! ├─────────────────────────────────────────────────────────────┤
//! │             SIMD distance kernels (runtime dispatch)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │   VectorArena (growable mmap, zero-copy)  ·  MetadataStore  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod filter;
pub mod format;
pub mod hnsw;
pub mod metadata;
pub mod simd;
pub mod store;

pub use filter::{Filter, NumericOp};
pub use format::{ArenaHeader, FormatError, Metric};
pub use hnsw::{GraphError, GraphStats, Hnsw, VectorSource};
pub use metadata::{Bias, DocType, MetadataError, MetadataRecord, MetadataStore};
pub use simd::{kernel, DistanceKernel, SimdLevel};
pub use store::{StoreError, VectorArena};
