//! Local file capability
//!
//! Engines never assume a physical filesystem; they read and write
//! through [`LocalFile`] handles opened by a [`FileStore`]. A disk
//! implementation backs the CLI and an in-memory implementation backs
//! the tests.

mod disk;
mod memory;

pub use disk::DiskStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// File could not be opened or created
    #[error("open failed: {0}")]
    Open(String),

    /// Read failure
    #[error("read failed: {0}")]
    Read(String),

    /// Write failure
    #[error("write failed: {0}")]
    Write(String),

    /// Seek or truncate failure
    #[error("seek failed: {0}")]
    Seek(String),

    /// Metadata could not be retrieved
    #[error("metadata unavailable: {0}")]
    Metadata(String),

    /// Delete failure
    #[error("delete failed: {0}")]
    Delete(String),
}

/// Size and modification time of a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    /// Length in bytes
    pub size: u64,
    /// Modification time, seconds since the Unix epoch
    pub mtime: Option<i64>,
    /// Unix permission bits
    pub mode: Option<u32>,
}

/// An open local file, read- or write-oriented.
#[async_trait]
pub trait LocalFile: Send {
    /// Read up to `buf.len()` bytes; 0 means end of file.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Append/write the whole buffer at the current position.
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), StorageError>;

    /// Reposition to an absolute offset.
    async fn seek(&mut self, offset: u64) -> Result<(), StorageError>;

    /// Cut the file to `len` bytes.
    async fn truncate(&mut self, len: u64) -> Result<(), StorageError>;

    /// Flush pending writes to the backing store.
    async fn flush(&mut self) -> Result<(), StorageError>;
}

/// Opens, deletes, and inspects files for the engines.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Open an existing file for reading and report its metadata.
    async fn open_source(&self, path: &Path)
        -> Result<(Box<dyn LocalFile>, FileMeta), StorageError>;

    /// Open a file for writing.
    ///
    /// With `resume` the existing contents are kept and the handle is
    /// positioned at the end; otherwise the file is created empty.
    /// Returns the handle and the length the file had on open.
    async fn open_sink(&self, path: &Path, resume: bool)
        -> Result<(Box<dyn LocalFile>, u64), StorageError>;

    /// Length of an existing file, or `None` if it does not exist.
    async fn existing_size(&self, path: &Path) -> Option<u64>;

    /// Remove a file. Removing a missing file is not an error.
    async fn delete(&self, path: &Path) -> Result<(), StorageError>;
}
