//! Local filesystem drive: objects as files under a root directory.
//!
//! Doubles as the reference implementation of [`Drive`] and as an offline
//! backing store; hashing is SHA-256 hex.

use crate::drive::{Drive, ObjectMeta};
use crate::error::FsError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::fs;
use tracing::trace;

pub struct LocalFsDrive {
    name: String,
    root: PathBuf,
    capacity: u64,
}

impl LocalFsDrive {
    pub async fn new(name: String, root: PathBuf, capacity: u64) -> Result<Self, FsError> {
        fs::create_dir_all(&root).await?;
        Ok(Self {
            name,
            root,
            capacity,
        })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    async fn used_bytes(&self) -> Result<u64, FsError> {
        let mut used = 0u64;
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_file() {
                used += meta.len();
            }
        }
        Ok(used)
    }
}

fn map_not_found(e: std::io::Error) -> FsError {
    if e.kind() == std::io::ErrorKind::NotFound {
        FsError::NotFound
    } else {
        FsError::Io(e)
    }
}

#[async_trait]
impl Drive for LocalFsDrive {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, FsError> {
        fs::read(self.path_for(name)).await.map_err(map_not_found)
    }

    async fn put(&self, name: &str, data: &[u8]) -> Result<(), FsError> {
        // write-then-rename so readers never observe a partial object
        let path = self.path_for(name);
        let tmp = self.path_for(&format!("{name}.tmp"));
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &path).await?;
        trace!(drive = %self.name, object = name, bytes = data.len(), "stored object");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), FsError> {
        fs::remove_file(self.path_for(name))
            .await
            .map_err(map_not_found)
    }

    async fn rename(&self, old: &str, new: &str) -> Result<(), FsError> {
        fs::rename(self.path_for(old), self.path_for(new))
            .await
            .map_err(map_not_found)
    }

    async fn get_metadata(&self, name: &str) -> Result<ObjectMeta, FsError> {
        let path = self.path_for(name);
        let meta = fs::metadata(&path).await.map_err(map_not_found)?;
        let data = fs::read(&path).await.map_err(map_not_found)?;
        Ok(ObjectMeta {
            size: meta.len(),
            hash: self.compute_hash(&data),
            modified: meta.modified().ok(),
        })
    }

    async fn free_space(&self) -> Result<u64, FsError> {
        Ok(self.capacity.saturating_sub(self.used_bytes().await?))
    }

    fn compute_hash(&self, data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drive() -> (tempfile::TempDir, LocalFsDrive) {
        let dir = tempfile::tempdir().unwrap();
        let drive = LocalFsDrive::new("local".to_string(), dir.path().join("objects"), 1 << 20)
            .await
            .unwrap();
        (dir, drive)
    }

    #[tokio::test]
    async fn put_get_delete() {
        let (_dir, drive) = drive().await;

        drive.put("a.bin", b"hello").await.unwrap();
        assert_eq!(drive.get("a.bin").await.unwrap(), b"hello");

        drive.delete("a.bin").await.unwrap();
        assert!(matches!(drive.get("a.bin").await, Err(FsError::NotFound)));
        assert!(matches!(
            drive.delete("a.bin").await,
            Err(FsError::NotFound)
        ));
    }

    #[tokio::test]
    async fn put_overwrites() {
        let (_dir, drive) = drive().await;
        drive.put("a.bin", b"one").await.unwrap();
        drive.put("a.bin", b"two").await.unwrap();
        assert_eq!(drive.get("a.bin").await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn metadata_reports_size_and_hash() {
        let (_dir, drive) = drive().await;
        drive.put("a.bin", b"hello").await.unwrap();

        let meta = drive.get_metadata("a.bin").await.unwrap();
        assert_eq!(meta.size, 5);
        assert_eq!(meta.hash, drive.compute_hash(b"hello"));
        assert!(meta.modified.is_some());
    }

    #[tokio::test]
    async fn free_space_shrinks_with_usage() {
        let (_dir, drive) = drive().await;
        let before = drive.free_space().await.unwrap();
        drive.put("a.bin", &[0u8; 1000]).await.unwrap();
        let after = drive.free_space().await.unwrap();
        assert_eq!(before - after, 1000);
    }

    #[tokio::test]
    async fn rename_moves_object() {
        let (_dir, drive) = drive().await;
        drive.put("old.bin", b"data").await.unwrap();
        drive.rename("old.bin", "new.bin").await.unwrap();
        assert!(matches!(drive.get("old.bin").await, Err(FsError::NotFound)));
        assert_eq!(drive.get("new.bin").await.unwrap(), b"data");
    }
}
