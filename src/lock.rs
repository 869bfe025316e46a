//! Per-database process lock
//!
//! A sentinel `lockfile` in the database directory, created with
//! `create_new` so acquisition is atomic at the filesystem level. Holding
//! the handle means this process owns the database for writing; the file is
//! removed on drop. A crash can leave the sentinel behind — the error
//! message names the file so an operator can clear it after confirming no
//! writer is alive.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{DbError, Result};

pub(crate) const LOCKFILE_NAME: &str = "lockfile";

/// Held for the lifetime of an open database handle.
#[derive(Debug)]
pub(crate) struct DbLock {
    path: PathBuf,
}

impl DbLock {
    pub(crate) fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCKFILE_NAME);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(DbError::Concurrency(format!(
                "another process holds {}",
                path.display()
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for DbLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
