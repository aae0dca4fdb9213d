//! File store capability.
//!
//! The transfer engine never touches the filesystem directly. Owners read
//! slices through [`FileStore::read_range`]; requesters persist the merged
//! file with [`FileStore::write_all`].

use crate::chunker::ByteRange;
use crate::error::{FileError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::RwLock;

/// Byte-oriented access to files by path
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Size of the file in bytes
    async fn size(&self, path: &Path) -> Result<u64>;

    /// Read `range` from the file
    async fn read_range(&self, path: &Path, range: ByteRange) -> Result<Vec<u8>>;

    /// Replace the file's contents, creating it (and parent directories) if needed
    async fn write_all(&self, path: &Path, data: &[u8]) -> Result<()>;
}

fn map_not_found(path: &Path, e: std::io::Error) -> FileError {
    if e.kind() == std::io::ErrorKind::NotFound {
        FileError::NotFound(path.to_path_buf())
    } else {
        FileError::from(e)
    }
}

/// [`FileStore`] backed by the local filesystem
#[derive(Debug, Clone, Default)]
pub struct LocalFileStore;

impl LocalFileStore {
    /// Create a new local store
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn size(&self, path: &Path) -> Result<u64> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| map_not_found(path, e))?;
        Ok(metadata.len())
    }

    async fn read_range(&self, path: &Path, range: ByteRange) -> Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| map_not_found(path, e))?;
        let size = file.metadata().await?.len();
        if !range.fits(size) {
            return Err(FileError::InvalidRange {
                start: range.start,
                end: range.end,
                size,
            });
        }

        file.seek(SeekFrom::Start(range.start)).await?;
        let mut buf = vec![0u8; range.len() as usize];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn write_all(&self, path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, data).await?;
        tracing::debug!("Wrote {} bytes to {}", data.len(), path.display());
        Ok(())
    }
}

/// In-memory [`FileStore`] for tests and loopback transfers
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: RwLock<HashMap<PathBuf, Vec<u8>>>,
}

impl MemoryFileStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file
    pub async fn insert(&self, path: impl Into<PathBuf>, data: Vec<u8>) {
        self.files.write().await.insert(path.into(), data);
    }

    /// Copy of a file's contents
    pub async fn get(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.read().await.get(path).cloned()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn size(&self, path: &Path) -> Result<u64> {
        self.files
            .read()
            .await
            .get(path)
            .map(|data| data.len() as u64)
            .ok_or_else(|| FileError::NotFound(path.to_path_buf()))
    }

    async fn read_range(&self, path: &Path, range: ByteRange) -> Result<Vec<u8>> {
        let files = self.files.read().await;
        let data = files
            .get(path)
            .ok_or_else(|| FileError::NotFound(path.to_path_buf()))?;
        let size = data.len() as u64;
        if !range.fits(size) {
            return Err(FileError::InvalidRange {
                start: range.start,
                end: range.end,
                size,
            });
        }
        Ok(data[range.start as usize..range.end as usize].to_vec())
    }

    async fn write_all(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.insert(path, data.to_vec()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_read_range() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("song.ogg");
        tokio::fs::write(&path, b"0123456789").await.unwrap();

        let store = LocalFileStore::new();
        assert_eq!(store.size(&path).await.unwrap(), 10);
        assert_eq!(
            store.read_range(&path, ByteRange::new(3, 7)).await.unwrap(),
            b"3456".to_vec()
        );
        assert!(store.read_range(&path, ByteRange::new(0, 0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_range_out_of_bounds() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.bin");
        tokio::fs::write(&path, b"abc").await.unwrap();

        let err = LocalFileStore::new()
            .read_range(&path, ByteRange::new(1, 5))
            .await
            .unwrap_err();
        assert_eq!(err, FileError::InvalidRange { start: 1, end: 5, size: 3 });
    }

    #[tokio::test]
    async fn test_local_write_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("downloads").join("nested").join("out.bin");

        let store = LocalFileStore::new();
        store.write_all(&path, b"payload").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"payload".to_vec());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing");
        assert!(matches!(
            LocalFileStore::new().size(&path).await,
            Err(FileError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryFileStore::new();
        store.insert("/share/a.txt", b"hello world".to_vec()).await;

        let path = Path::new("/share/a.txt");
        assert_eq!(store.size(path).await.unwrap(), 11);
        assert_eq!(
            store.read_range(path, ByteRange::new(6, 11)).await.unwrap(),
            b"world".to_vec()
        );

        store.write_all(Path::new("/dl/a.txt"), b"x").await.unwrap();
        assert_eq!(store.get(Path::new("/dl/a.txt")).await, Some(b"x".to_vec()));
    }
}
