//! HNSW (Hierarchical Navigable Small World) index
//!
//! A layered proximity graph over vector ids. Higher layers are sparser and
//! give long-range hops; layer 0 holds every node. Search descends greedily
//! from the entry point, then runs a beam search on layer 0.
//!
//! The graph never owns vector data: every operation takes a
//! [`VectorSource`], and nodes reference each other by integer id into one
//! flat `Vec` of adjacency records. No per-node heap objects, no pointer
//! cycles.

mod index;
mod node;
mod serialize;
mod visited;

pub use index::{GraphStats, Hnsw};
pub use node::Node;
pub use serialize::GraphError;
pub use visited::VisitedGuard;

/// Read access to vectors by id.
///
/// Implementations must return a slice of the database dimension for every
/// id the graph knows about; the arena upholds this because ids enter the
/// graph only after the corresponding append.
pub trait VectorSource {
    fn vector(&self, id: u32) -> &[f32];
}

impl VectorSource for Vec<Vec<f32>> {
    #[inline]
    fn vector(&self, id: u32) -> &[f32] {
        &self[id as usize]
    }
}
