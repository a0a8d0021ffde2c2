//! Disk-backed file store using tokio::fs

use super::{FileMeta, FileStore, LocalFile, StorageError};
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// File store rooted in the real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskStore;

impl DiskStore {
    /// Create a disk store.
    pub fn new() -> Self {
        Self
    }
}

struct DiskFile {
    file: File,
}

#[async_trait]
impl LocalFile for DiskFile {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
        self.file
            .read(buf)
            .await
            .map_err(|e| StorageError::Read(e.to_string()))
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), StorageError> {
        self.file
            .write_all(buf)
            .await
            .map_err(|e| StorageError::Write(e.to_string()))
    }

    async fn seek(&mut self, offset: u64) -> Result<(), StorageError> {
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map(|_| ())
            .map_err(|e| StorageError::Seek(e.to_string()))
    }

    async fn truncate(&mut self, len: u64) -> Result<(), StorageError> {
        self.file
            .flush()
            .await
            .map_err(|e| StorageError::Write(e.to_string()))?;
        self.file
            .set_len(len)
            .await
            .map_err(|e| StorageError::Seek(e.to_string()))
    }

    async fn flush(&mut self) -> Result<(), StorageError> {
        self.file
            .flush()
            .await
            .map_err(|e| StorageError::Write(e.to_string()))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| StorageError::Write(e.to_string()))
    }
}

#[async_trait]
impl FileStore for DiskStore {
    async fn open_source(
        &self,
        path: &Path,
    ) -> Result<(Box<dyn LocalFile>, FileMeta), StorageError> {
        let file = File::open(path)
            .await
            .map_err(|e| StorageError::Open(format!("{}: {e}", path.display())))?;
        let meta = file
            .metadata()
            .await
            .map_err(|e| StorageError::Metadata(e.to_string()))?;

        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64);

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            Some(meta.permissions().mode() & 0o7777)
        };
        #[cfg(not(unix))]
        let mode = None;

        Ok((
            Box::new(DiskFile { file }),
            FileMeta {
                size: meta.len(),
                mtime,
                mode,
            },
        ))
    }

    async fn open_sink(
        &self,
        path: &Path,
        resume: bool,
    ) -> Result<(Box<dyn LocalFile>, u64), StorageError> {
        let mut options = OpenOptions::new();
        options.write(true).read(true).create(true);
        if !resume {
            options.truncate(true);
        }
        let mut file = options
            .open(path)
            .await
            .map_err(|e| StorageError::Open(format!("{}: {e}", path.display())))?;

        let len = file
            .metadata()
            .await
            .map_err(|e| StorageError::Metadata(e.to_string()))?
            .len();
        if resume {
            file.seek(SeekFrom::Start(len))
                .await
                .map_err(|e| StorageError::Seek(e.to_string()))?;
        }
        Ok((Box::new(DiskFile { file }), len))
    }

    async fn existing_size(&self, path: &Path) -> Option<u64> {
        tokio::fs::metadata(path).await.ok().map(|m| m.len())
    }

    async fn delete(&self, path: &Path) -> Result<(), StorageError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Delete(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_then_source_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let store = DiskStore::new();

        let (mut sink, existing) = store.open_sink(&path, false).await.unwrap();
        assert_eq!(existing, 0);
        sink.write_all(b"disk bytes").await.unwrap();
        sink.flush().await.unwrap();
        drop(sink);

        let (mut source, meta) = store.open_source(&path).await.unwrap();
        assert_eq!(meta.size, 10);
        let mut buf = [0u8; 16];
        let n = source.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"disk bytes");
    }

    #[tokio::test]
    async fn test_resume_keeps_existing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        let store = DiskStore::new();

        let (mut sink, _) = store.open_sink(&path, false).await.unwrap();
        sink.write_all(b"1234").await.unwrap();
        sink.flush().await.unwrap();
        drop(sink);

        let (mut sink, existing) = store.open_sink(&path, true).await.unwrap();
        assert_eq!(existing, 4);
        sink.write_all(b"5678").await.unwrap();
        sink.flush().await.unwrap();
        drop(sink);

        assert_eq!(store.existing_size(&path).await, Some(8));
    }

    #[tokio::test]
    async fn test_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("padded.bin");
        let store = DiskStore::new();

        let (mut sink, _) = store.open_sink(&path, false).await.unwrap();
        sink.write_all(&[0x1A; 128]).await.unwrap();
        sink.truncate(5).await.unwrap();
        sink.flush().await.unwrap();
        drop(sink);

        assert_eq!(store.existing_size(&path).await, Some(5));
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new();
        store.delete(&dir.path().join("nope")).await.unwrap();
    }
}
