//! Database error taxonomy
//!
//! Core-module errors fold into this enum at the façade boundary: anything
//! format-shaped becomes `Corruption`, anything IO-shaped stays `Io`.
//! Errors propagate to the caller verbatim; nothing retries internally.

use thiserror::Error;

use vantage_core::{FormatError, GraphError, MetadataError, StoreError};

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    /// File not found, permission denied, disk full, and friends.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad magic, unknown format version, truncated or inconsistent files.
    /// Fatal for the handle; the filesystem is left untouched.
    #[error("corrupt database: {0}")]
    Corruption(String),

    /// Rejected before any state change: dimension mismatch, empty vector,
    /// k = 0, nonsensical filter, use-after-close.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An insert would push the arena past the configured hard cap.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// Another process holds the database's write lock.
    #[error("database is locked: {0}")]
    Concurrency(String),

    /// Unknown or tombstoned id in a strict-mode operation.
    #[error("id {0} not found")]
    NotFound(u32),
}

impl From<FormatError> for DbError {
    fn from(err: FormatError) -> Self {
        match err {
            FormatError::Io(io) => DbError::Io(io),
            other => DbError::Corruption(other.to_string()),
        }
    }
}

impl From<StoreError> for DbError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io(io) => DbError::Io(io),
            StoreError::Format(format) => format.into(),
            StoreError::DimensionMismatch { expected, actual } => DbError::InvalidArgument(
                format!("dimension mismatch: expected {expected}, got {actual}"),
            ),
            other => DbError::Corruption(other.to_string()),
        }
    }
}

impl From<MetadataError> for DbError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::Io(io) => DbError::Io(io),
            MetadataError::InvalidDate(date) => {
                DbError::InvalidArgument(format!("invalid date: {date:?}"))
            }
            other => DbError::Corruption(other.to_string()),
        }
    }
}

impl From<GraphError> for DbError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::Io(io) => DbError::Io(io),
            other => DbError::Corruption(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_errors_map_to_corruption() {
        let err: DbError = FormatError::UnsupportedVersion(9).into();
        assert!(matches!(err, DbError::Corruption(_)));

        let err: DbError = GraphError::InvalidMagic.into();
        assert!(matches!(err, DbError::Corruption(_)));
    }

    #[test]
    fn io_stays_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: DbError = StoreError::Io(io).into();
        assert!(matches!(err, DbError::Io(_)));
    }

    #[test]
    fn dimension_mismatch_is_invalid_argument() {
        let err: DbError = StoreError::DimensionMismatch {
            expected: 4,
            actual: 3,
        }
        .into();
        assert!(matches!(err, DbError::InvalidArgument(_)));
    }
}
