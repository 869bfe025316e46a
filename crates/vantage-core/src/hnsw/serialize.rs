//! Graph serialization (`index.hnsw`)
//!
//! # File Structure
//!
//! ```text
//! Offset   Size    Type        Description
//! ─────────────────────────────────────────────
//! 0x00     8       [u8; 8]     Magic: "VDBHNSW1"
//! 0x08     4       u32 LE      Format version (1)
//! 0x0C     4       u32 LE      N: Number of nodes
//! 0x10     4       u32 LE      M
//! 0x14     4       u32 LE      M₀
//! 0x18     4       u32 LE      ef_construction
//! 0x1C     4       f32 LE      mₗ (level multiplier)
//! 0x20     4       u32 LE      Entry point id (u32::MAX = none)
//! 0x24     4       u32 LE      Max layer
//! ─────────────────────────────────────────────
//! Body, for each id 0..N:
//!   top_layer  u8
//!   for each layer 0..=top_layer:
//!     count    u16
//!     ids      [u32; count]
//! ```
//!
//! All integers little-endian. The metric and RNG seed are not repeated
//! here; they live in the arena header and are supplied at load time.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use thiserror::Error;

use super::index::Hnsw;
use super::node::Node;
use crate::format::{Metric, GRAPH_MAGIC, GRAPH_VERSION};

const NO_ENTRY: u32 = u32::MAX;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("invalid magic bytes: expected VDBHNSW1")]
    InvalidMagic,

    #[error("unsupported graph format version: {0}")]
    UnsupportedVersion(u32),

    #[error("malformed graph: {0}")]
    Malformed(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Hnsw {
    /// Serialize the graph to a writer.
    pub fn serialize<W: Write>(&self, writer: &mut W) -> Result<(), GraphError> {
        writer.write_all(&GRAPH_MAGIC)?;
        writer.write_all(&GRAPH_VERSION.to_le_bytes())?;
        writer.write_all(&(self.nodes.len() as u32).to_le_bytes())?;
        writer.write_all(&(self.m as u32).to_le_bytes())?;
        writer.write_all(&(self.m0 as u32).to_le_bytes())?;
        writer.write_all(&(self.ef_construction as u32).to_le_bytes())?;
        writer.write_all(&(self.ml as f32).to_le_bytes())?;
        writer.write_all(&self.entry_point.unwrap_or(NO_ENTRY).to_le_bytes())?;
        writer.write_all(&(self.max_layer as u32).to_le_bytes())?;

        for node in &self.nodes {
            writer.write_all(&(node.top_layer() as u8).to_le_bytes())?;
            for neighbors in &node.layers {
                writer.write_all(&(neighbors.len() as u16).to_le_bytes())?;
                for &neighbor in neighbors {
                    writer.write_all(&neighbor.to_le_bytes())?;
                }
            }
        }
        Ok(())
    }

    /// Write the graph to a file, fsyncing before returning.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), GraphError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        self.serialize(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Load a graph from a file. `metric` and `seed` come from the arena
    /// header; the seed is mixed with the node count so later inserts keep
    /// assigning the same layers as an uninterrupted build of the same
    /// history.
    pub fn load(path: impl AsRef<Path>, metric: Metric, seed: u64) -> Result<Self, GraphError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        Self::deserialize(&mut reader, metric, seed)
    }

    /// Read a graph from a reader. See [`Hnsw::load`].
    pub fn deserialize<R: Read>(
        reader: &mut R,
        metric: Metric,
        seed: u64,
    ) -> Result<Self, GraphError> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if magic != GRAPH_MAGIC {
            return Err(GraphError::InvalidMagic);
        }

        let version = read_u32(reader)?;
        if version != GRAPH_VERSION {
            return Err(GraphError::UnsupportedVersion(version));
        }

        let count = read_u32(reader)? as usize;
        let m = read_u32(reader)? as usize;
        let m0 = read_u32(reader)? as usize;
        let ef_construction = read_u32(reader)? as usize;
        let ml = f32::from_le_bytes(read_array(reader)?) as f64;
        let entry_raw = read_u32(reader)?;
        let max_layer = read_u32(reader)? as usize;

        if m < 2 || m0 < m {
            return Err(GraphError::Malformed(format!(
                "implausible parameters: m={m}, m0={m0}"
            )));
        }

        let entry_point = if entry_raw == NO_ENTRY {
            None
        } else if (entry_raw as usize) < count {
            Some(entry_raw)
        } else {
            return Err(GraphError::Malformed(format!(
                "entry point {entry_raw} out of range for {count} nodes"
            )));
        };

        let mut nodes = Vec::with_capacity(count);
        for id in 0..count {
            let top_layer = read_u8(reader)? as usize;
            if top_layer > max_layer {
                return Err(GraphError::Malformed(format!(
                    "node {id} top layer {top_layer} exceeds graph max {max_layer}"
                )));
            }

            let mut layers = Vec::with_capacity(top_layer + 1);
            for layer in 0..=top_layer {
                let n = read_u16(reader)? as usize;
                let cap = if layer == 0 { m0 } else { m };
                if n > cap {
                    return Err(GraphError::Malformed(format!(
                        "node {id} layer {layer} has {n} neighbors, capacity {cap}"
                    )));
                }
                let mut neighbors = Vec::with_capacity(n);
                for _ in 0..n {
                    let neighbor = read_u32(reader)?;
                    if neighbor as usize >= count {
                        return Err(GraphError::Malformed(format!(
                            "node {id} references unknown neighbor {neighbor}"
                        )));
                    }
                    neighbors.push(neighbor);
                }
                layers.push(neighbors);
            }
            nodes.push(Node::from_layers(layers));
        }

        Ok(Hnsw::from_parts(
            nodes,
            entry_point,
            max_layer,
            m,
            m0,
            ml,
            ef_construction,
            metric,
            seed.wrapping_add(count as u64),
        ))
    }
}

fn read_array<R: Read, const N: usize>(reader: &mut R) -> Result<[u8; N], GraphError> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8, GraphError> {
    Ok(read_array::<_, 1>(reader)?[0])
}

fn read_u16<R: Read>(reader: &mut R) -> Result<u16, GraphError> {
    Ok(u16::from_le_bytes(read_array(reader)?))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, GraphError> {
    Ok(u32::from_le_bytes(read_array(reader)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simd::l2_normalized;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use tempfile::tempdir;

    fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let v: Vec<f32> = (0..dim).map(|_| rng.gen::<f32>() - 0.5).collect();
                l2_normalized(&v)
            })
            .collect()
    }

    #[test]
    fn roundtrip_preserves_graph_and_search_results() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.hnsw");

        let vectors = random_vectors(150, 32, 1);
        let mut hnsw = Hnsw::new(16, 100, Metric::Cosine, 42);
        for id in 0..150u32 {
            hnsw.insert(&vectors, id);
        }
        hnsw.save(&path).unwrap();

        let loaded = Hnsw::load(&path, Metric::Cosine, 42).unwrap();
        assert_eq!(loaded.len(), 150);
        assert_eq!(loaded.entry_point(), hnsw.entry_point());
        assert_eq!(loaded.max_layer(), hnsw.max_layer());

        let query = &vectors[77];
        let before = hnsw.search(&vectors, query, 10, 64, |_| true);
        let after = loaded.search(&vectors, query, 10, 64, |_| true);
        assert_eq!(before, after);
    }

    #[test]
    fn serialization_is_deterministic() {
        let vectors = random_vectors(100, 16, 2);

        let mut bufs = Vec::new();
        for _ in 0..2 {
            let mut hnsw = Hnsw::new(8, 60, Metric::L2, 7);
            for id in 0..100u32 {
                hnsw.insert(&vectors, id);
            }
            let mut buf = Vec::new();
            hnsw.serialize(&mut buf).unwrap();
            bufs.push(buf);
        }
        assert_eq!(bufs[0], bufs[1]);
    }

    #[test]
    fn empty_graph_roundtrip() {
        let hnsw = Hnsw::new(16, 100, Metric::L2, 0);
        let mut buf = Vec::new();
        hnsw.serialize(&mut buf).unwrap();

        let loaded = Hnsw::deserialize(&mut buf.as_slice(), Metric::L2, 0).unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.entry_point(), None);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = vec![0u8; 64];
        buf[0..8].copy_from_slice(b"NOTAGRPH");
        assert!(matches!(
            Hnsw::deserialize(&mut buf.as_slice(), Metric::L2, 0),
            Err(GraphError::InvalidMagic)
        ));
    }

    #[test]
    fn rejects_unknown_version() {
        let hnsw = Hnsw::new(16, 100, Metric::L2, 0);
        let mut buf = Vec::new();
        hnsw.serialize(&mut buf).unwrap();
        buf[8..12].copy_from_slice(&99u32.to_le_bytes());

        assert!(matches!(
            Hnsw::deserialize(&mut buf.as_slice(), Metric::L2, 0),
            Err(GraphError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn rejects_truncated_body() {
        let vectors = random_vectors(50, 16, 3);
        let mut hnsw = Hnsw::new(8, 60, Metric::L2, 1);
        for id in 0..50u32 {
            hnsw.insert(&vectors, id);
        }
        let mut buf = Vec::new();
        hnsw.serialize(&mut buf).unwrap();
        buf.truncate(buf.len() - 5);

        assert!(matches!(
            Hnsw::deserialize(&mut buf.as_slice(), Metric::L2, 1),
            Err(GraphError::Io(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_entry_point() {
        let vectors = random_vectors(10, 8, 4);
        let mut hnsw = Hnsw::new(8, 60, Metric::L2, 1);
        for id in 0..10u32 {
            hnsw.insert(&vectors, id);
        }
        let mut buf = Vec::new();
        hnsw.serialize(&mut buf).unwrap();
        // Entry point field lives at offset 0x20.
        buf[0x20..0x24].copy_from_slice(&1000u32.to_le_bytes());

        assert!(matches!(
            Hnsw::deserialize(&mut buf.as_slice(), Metric::L2, 1),
            Err(GraphError::Malformed(_))
        ));
    }
}
