//! On-disk cache of file bodies, one file per inode.

use crate::error::FsError;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::trace;

/// Maps inodes to local body files. The path is deterministic from the
/// inode; an entry exists iff the body has been materialized since mount.
pub struct DiskCache {
    base_dir: PathBuf,
}

impl DiskCache {
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self, FsError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;
        Ok(Self { base_dir })
    }

    pub fn path_for(&self, inode: i64) -> PathBuf {
        self.base_dir.join(format!("body-{inode}"))
    }

    pub async fn contains(&self, inode: i64) -> bool {
        fs::try_exists(self.path_for(inode)).await.unwrap_or(false)
    }

    /// Write a full body, creating or replacing the entry.
    pub async fn materialize(&self, inode: i64, data: &[u8]) -> Result<(), FsError> {
        fs::write(self.path_for(inode), data).await?;
        trace!(inode, bytes = data.len(), "materialized body");
        Ok(())
    }

    /// Read up to `len` bytes at `offset`; short at EOF.
    pub async fn read_at(&self, inode: i64, offset: u64, len: usize) -> Result<Vec<u8>, FsError> {
        let mut file = OpenOptions::new()
            .read(true)
            .open(self.path_for(inode))
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; len];
        let mut read = 0usize;
        while read < len {
            let n = file.read(&mut buf[read..]).await?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);
        Ok(buf)
    }

    /// Write `data` at `offset`, extending the body if needed. Returns the
    /// new body length.
    pub async fn write_at(&self, inode: i64, offset: u64, data: &[u8]) -> Result<u64, FsError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path_for(inode))
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(file.metadata().await?.len())
    }

    pub async fn truncate(&self, inode: i64, size: u64) -> Result<(), FsError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path_for(inode))
            .await?;
        file.set_len(size).await?;
        Ok(())
    }

    pub async fn len(&self, inode: i64) -> Result<u64, FsError> {
        Ok(fs::metadata(self.path_for(inode)).await?.len())
    }

    pub async fn read_all(&self, inode: i64) -> Result<Vec<u8>, FsError> {
        Ok(fs::read(self.path_for(inode)).await?)
    }

    /// Drop a cached body. A later open re-materializes from the drive.
    pub async fn invalidate(&self, inode: i64) -> Result<(), FsError> {
        match fs::remove_file(self.path_for(inode)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
