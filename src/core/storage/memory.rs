//! In-memory file store
//!
//! A `HashMap` of path to byte vector behind a lock. Conforms to the
//! same capability as the disk store so engines can be exercised
//! without touching the filesystem.

use super::{FileMeta, FileStore, LocalFile, StorageError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

type Shared = Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>;

/// File store over an in-process map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    files: Shared,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file with contents.
    pub fn insert(&self, path: impl Into<PathBuf>, data: Vec<u8>) {
        self.files.lock().insert(path.into(), data);
    }

    /// Current contents of a file, if present.
    pub fn get(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    /// Whether a file exists.
    pub fn contains(&self, path: &Path) -> bool {
        self.files.lock().contains_key(path)
    }
}

struct MemoryFile {
    files: Shared,
    path: PathBuf,
    pos: u64,
}

#[async_trait]
impl LocalFile for MemoryFile {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
        let files = self.files.lock();
        let data = files
            .get(&self.path)
            .ok_or_else(|| StorageError::Read("file vanished".into()))?;
        let start = (self.pos as usize).min(data.len());
        let n = (data.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&data[start..start + n]);
        drop(files);
        self.pos += n as u64;
        Ok(n)
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), StorageError> {
        let mut files = self.files.lock();
        let data = files
            .get_mut(&self.path)
            .ok_or_else(|| StorageError::Write("file vanished".into()))?;
        let start = self.pos as usize;
        if data.len() < start {
            data.resize(start, 0);
        }
        let overlap = (data.len() - start).min(buf.len());
        data[start..start + overlap].copy_from_slice(&buf[..overlap]);
        data.extend_from_slice(&buf[overlap..]);
        drop(files);
        self.pos += buf.len() as u64;
        Ok(())
    }

    async fn seek(&mut self, offset: u64) -> Result<(), StorageError> {
        self.pos = offset;
        Ok(())
    }

    async fn truncate(&mut self, len: u64) -> Result<(), StorageError> {
        let mut files = self.files.lock();
        let data = files
            .get_mut(&self.path)
            .ok_or_else(|| StorageError::Seek("file vanished".into()))?;
        data.truncate(len as usize);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[async_trait]
impl FileStore for MemoryStore {
    async fn open_source(
        &self,
        path: &Path,
    ) -> Result<(Box<dyn LocalFile>, FileMeta), StorageError> {
        let size = {
            let files = self.files.lock();
            files
                .get(path)
                .map(|d| d.len() as u64)
                .ok_or_else(|| StorageError::Open(format!("{}: not found", path.display())))?
        };
        Ok((
            Box::new(MemoryFile {
                files: self.files.clone(),
                path: path.to_path_buf(),
                pos: 0,
            }),
            FileMeta {
                size,
                mtime: None,
                mode: None,
            },
        ))
    }

    async fn open_sink(
        &self,
        path: &Path,
        resume: bool,
    ) -> Result<(Box<dyn LocalFile>, u64), StorageError> {
        let mut files = self.files.lock();
        let entry = files.entry(path.to_path_buf()).or_default();
        if !resume {
            entry.clear();
        }
        let len = entry.len() as u64;
        drop(files);
        Ok((
            Box::new(MemoryFile {
                files: self.files.clone(),
                path: path.to_path_buf(),
                pos: len,
            }),
            len,
        ))
    }

    async fn existing_size(&self, path: &Path) -> Option<u64> {
        self.files.lock().get(path).map(|d| d.len() as u64)
    }

    async fn delete(&self, path: &Path) -> Result<(), StorageError> {
        self.files.lock().remove(path);
        Ok(())
    }
}
