//! Memory-mapped vector arena
//!
//! Append-only, fixed-stride storage for f32 vectors backed by a growable
//! memory-mapped file (`vectors.bin`). Reads are zero-copy: `get` returns a
//! slice straight into the mapping, converted with `bytemuck` so alignment
//! is checked rather than assumed.
//!
//! Growth doubles the file's record capacity and remaps. Callers serialize
//! growth against readers (the database holds its write lock across
//! `append`), so no reader ever observes a half-remapped arena.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use thiserror::Error;

use crate::format::{ArenaHeader, FormatError, Metric, ARENA_DATA_OFFSET, ARENA_HEADER_SIZE};
use crate::hnsw::VectorSource;

/// Initial capacity, in records, of a freshly created arena.
pub const INITIAL_CAPACITY: usize = 4096;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("format error: {0}")]
    Format(#[from] FormatError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("vector id out of bounds: {id} >= {count}")]
    OutOfBounds { id: u32, count: u32 },

    #[error("mapped region not aligned for f32 access")]
    Alignment,
}

/// Growable, memory-mapped arena of fixed-stride f32 vectors.
pub struct VectorArena {
    file: File,
    mmap: MmapMut,
    header: ArenaHeader,
    /// Records the current mapping can hold before the file must grow.
    capacity: usize,
    path: PathBuf,
}

impl VectorArena {
    /// Create a new arena file. Fails if the file already exists.
    pub fn create(
        path: impl AsRef<Path>,
        dimension: u32,
        metric: Metric,
        seed: u64,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let header = ArenaHeader::new(dimension, metric, seed);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        let capacity = INITIAL_CAPACITY;
        file.set_len((ARENA_DATA_OFFSET + capacity * header.stride()) as u64)?;

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap[..ARENA_HEADER_SIZE].copy_from_slice(&header.to_bytes());

        Ok(Self {
            file,
            mmap,
            header,
            capacity,
            path,
        })
    }

    /// Open an existing arena, validating header and physical size.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let header = ArenaHeader::from_bytes(&mmap)?;

        let needed = header.exact_file_size();
        if mmap.len() < needed {
            return Err(FormatError::Truncated {
                expected: needed,
                actual: mmap.len(),
            }
            .into());
        }

        let capacity = (mmap.len() - ARENA_DATA_OFFSET) / header.stride().max(1);

        Ok(Self {
            file,
            mmap,
            header,
            capacity,
            path,
        })
    }

    /// Number of stored vectors.
    #[inline]
    pub fn len(&self) -> u32 {
        self.header.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.header.count == 0
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.header.dimension as usize
    }

    #[inline]
    pub fn metric(&self) -> Metric {
        self.header.metric
    }

    #[inline]
    pub fn seed(&self) -> u64 {
        self.header.seed
    }

    /// Size of the backing file, including growth slack.
    pub fn file_bytes(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Append a vector, growing the file if needed. Returns the new id.
    ///
    /// The caller is responsible for normalization under the cosine metric;
    /// the arena stores bytes as given.
    pub fn append(&mut self, vector: &[f32]) -> Result<u32, StoreError> {
        if vector.len() != self.header.dimension as usize {
            return Err(StoreError::DimensionMismatch {
                expected: self.header.dimension as usize,
                actual: vector.len(),
            });
        }

        let id = self.header.count;
        if id as usize >= self.capacity {
            self.grow()?;
        }

        let start = self.header.offset(id as usize);
        let end = start + self.header.stride();
        self.mmap[start..end].copy_from_slice(bytemuck::cast_slice(vector));

        self.header.count = id + 1;
        self.write_count();
        Ok(id)
    }

    /// Roll back the most recent append. Used by the database to keep an
    /// insert atomic when a later step of the insert fails.
    pub fn pop(&mut self) {
        if self.header.count > 0 {
            self.header.count -= 1;
            self.write_count();
        }
    }

    /// Borrow the vector at `id`. Zero-copy; the slice points into the map.
    pub fn get(&self, id: u32) -> Result<&[f32], StoreError> {
        if id >= self.header.count {
            return Err(StoreError::OutOfBounds {
                id,
                count: self.header.count,
            });
        }
        let start = self.header.offset(id as usize);
        let end = start + self.header.stride();
        bytemuck::try_cast_slice(&self.mmap[start..end]).map_err(|_| StoreError::Alignment)
    }

    /// Iterate over all stored vectors in id order.
    pub fn iter(&self) -> impl Iterator<Item = &[f32]> + '_ {
        (0..self.header.count).map(move |id| self.row(id))
    }

    /// Flush dirty pages through to the file.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.mmap.flush()?;
        Ok(())
    }

    /// Bytes the file would need to hold one more record. Lets the database
    /// enforce a hard capacity cap before any state changes.
    pub fn bytes_after_append(&self) -> u64 {
        let needed = self.header.count as usize + 1;
        if needed <= self.capacity {
            self.mmap.len() as u64
        } else {
            let next = (self.capacity * 2).max(INITIAL_CAPACITY);
            (ARENA_DATA_OFFSET + next * self.header.stride()) as u64
        }
    }

    /// Flush and truncate the file to its exact size (no growth slack),
    /// consuming the arena. Called on database close so files at rest are
    /// exactly `4096 + N·D·4` bytes.
    pub fn seal(self) -> Result<(), StoreError> {
        let exact = self.header.exact_file_size() as u64;
        let Self { file, mmap, .. } = self;
        mmap.flush()?;
        drop(mmap);
        file.set_len(exact)?;
        file.sync_all()?;
        Ok(())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    fn row(&self, id: u32) -> &[f32] {
        debug_assert!(id < self.header.count);
        let start = self.header.offset(id as usize);
        let end = start + self.header.stride();
        bytemuck::cast_slice(&self.mmap[start..end])
    }

    fn write_count(&mut self) {
        self.mmap[20..24].copy_from_slice(&self.header.count.to_le_bytes());
    }

    fn grow(&mut self) -> Result<(), StoreError> {
        let new_capacity = (self.capacity * 2).max(INITIAL_CAPACITY);
        let new_len = (ARENA_DATA_OFFSET + new_capacity * self.header.stride()) as u64;

        self.mmap.flush()?;
        self.file.set_len(new_len)?;
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        self.capacity = new_capacity;
        Ok(())
    }
}

impl VectorSource for VectorArena {
    #[inline]
    fn vector(&self, id: u32) -> &[f32] {
        self.row(id)
    }
}
