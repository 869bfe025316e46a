//! On-disk format for the vector arena (`vectors.bin`)
//!
//! # File Structure
//!
//! ```text
//! Offset   Size    Type        Description
//! ─────────────────────────────────────────────
//! 0x00     8       [u8; 8]     Magic: "VDBVEC01"
//! 0x08     4       u32 LE      Format version (1)
//! 0x0C     4       u32 LE      D: Dimension
//! 0x10     1       u8          Metric (0 = cosine, 1 = L2)
//! 0x11     3       [u8; 3]     Padding (zero)
//! 0x14     4       u32 LE      N: Number of vectors
//! 0x18     8       u64 LE      Layer-assignment RNG seed
//! 0x20     32      [u8; 32]    Reserved (zero)
//! ─────────────────────────────────────────────
//! TOTAL: 64 bytes. Vector records start at offset 4096 (one OS page of
//! header keeps the data page-aligned for SIMD loads through the mmap).
//! ```
//!
//! `N` and the seed live inside the 47-byte reserved region that follows the
//! metric byte on the wire, so readers that only understand the fixed prefix
//! still parse the file.

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Magic bytes identifying a vector arena file.
pub const ARENA_MAGIC: [u8; 8] = *b"VDBVEC01";

/// Magic bytes identifying a serialized HNSW graph file.
pub const GRAPH_MAGIC: [u8; 8] = *b"VDBHNSW1";

/// Current arena format version.
pub const ARENA_VERSION: u32 = 1;

/// Current graph format version.
pub const GRAPH_VERSION: u32 = 1;

/// Size of the packed arena header in bytes.
pub const ARENA_HEADER_SIZE: usize = 64;

/// Byte offset where vector records begin.
pub const ARENA_DATA_OFFSET: usize = 4096;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("invalid magic bytes: expected {expected}")]
    InvalidMagic { expected: &'static str },

    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u32),

    #[error("unknown metric code: {0}")]
    UnknownMetric(u8),

    #[error("file truncated: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Distance metric, fixed at database creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Cosine,
    L2,
}

impl Metric {
    pub fn code(self) -> u8 {
        match self {
            Metric::Cosine => 0,
            Metric::L2 => 1,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, FormatError> {
        match code {
            0 => Ok(Metric::Cosine),
            1 => Ok(Metric::L2),
            other => Err(FormatError::UnknownMetric(other)),
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Metric::Cosine => write!(f, "cosine"),
            Metric::L2 => write!(f, "l2"),
        }
    }
}

/// Parsed arena file header.
#[derive(Debug, Clone, Copy)]
pub struct ArenaHeader {
    pub version: u32,
    pub dimension: u32,
    pub metric: Metric,
    pub count: u32,
    pub seed: u64,
}

impl ArenaHeader {
    pub fn new(dimension: u32, metric: Metric, seed: u64) -> Self {
        Self {
            version: ARENA_VERSION,
            dimension,
            metric,
            count: 0,
            seed,
        }
    }

    /// Parse the header from the first 64 bytes of the file.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < ARENA_HEADER_SIZE {
            return Err(FormatError::Truncated {
                expected: ARENA_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[0..8] != ARENA_MAGIC {
            return Err(FormatError::InvalidMagic { expected: "VDBVEC01" });
        }

        let version = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        if version != ARENA_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }

        let dimension = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        let metric = Metric::from_code(bytes[16])?;
        let count = u32::from_le_bytes(bytes[20..24].try_into().unwrap());
        let seed = u64::from_le_bytes(bytes[24..32].try_into().unwrap());

        Ok(Self {
            version,
            dimension,
            metric,
            count,
            seed,
        })
    }

    /// Write the header to exactly 64 bytes.
    pub fn to_bytes(&self) -> [u8; ARENA_HEADER_SIZE] {
        let mut buf = [0u8; ARENA_HEADER_SIZE];
        buf[0..8].copy_from_slice(&ARENA_MAGIC);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.dimension.to_le_bytes());
        buf[16] = self.metric.code();
        buf[20..24].copy_from_slice(&self.count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.seed.to_le_bytes());
        buf
    }

    /// Bytes occupied by one vector record.
    #[inline(always)]
    pub fn stride(&self) -> usize {
        self.dimension as usize * std::mem::size_of::<f32>()
    }

    /// Byte offset of the vector at `index`.
    #[inline(always)]
    pub fn offset(&self, index: usize) -> usize {
        ARENA_DATA_OFFSET + index * self.stride()
    }

    /// Exact file size for the current count, excluding growth slack.
    pub fn exact_file_size(&self) -> usize {
        ARENA_DATA_OFFSET + self.count as usize * self.stride()
    }
}
