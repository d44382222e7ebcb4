//! Uniform interface over remote object stores ("drives").
//!
//! Responsibilities:
//! - Object get/put/delete/rename plus metadata, free-space and hashing.
//! - The advisory lock protocol every mount must honor: a well-known lock
//!   object whose presence means some mount owns the lock.
//! - Url helpers tying a catalog row to the drive that stores its body.
//!
//! Hosted providers (Dropbox, Google Drive, ...) implement [`Drive`] in
//! their own adapter crates; the implementations here cover local disk and
//! in-memory storage.

pub mod localfs;
pub mod memory;

pub use localfs::LocalFsDrive;
pub use memory::MemoryDrive;

use crate::error::FsError;
use async_trait::async_trait;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

/// Remote name of the canonical catalog copy.
pub const CATALOG_OBJECT: &str = "cloudstash.db";

/// Remote name of the advisory lock object.
pub const LOCK_OBJECT: &str = "cloudstash.lock";

/// How long a lock may be held before other mounts treat it as stale.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Initial delay between lock polls; doubles up to [`LOCK_POLL_MAX`].
pub const LOCK_POLL: Duration = Duration::from_millis(500);

const LOCK_POLL_MAX: Duration = Duration::from_secs(10);

/// Metadata of a stored object as reported by the provider.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub size: u64,
    /// Provider-computed content digest. [`Drive::compute_hash`] must
    /// produce the same value for the same bytes.
    pub hash: String,
    pub modified: Option<SystemTime>,
}

/// A remote object-storage provider.
///
/// All operations are fallible and may block on the network; missing
/// objects fail with [`FsError::NotFound`]. `put` overwrites atomically
/// from the caller's perspective.
#[async_trait]
pub trait Drive: Send + Sync {
    /// Provider scheme, e.g. `dropbox`. Selects this drive in object urls.
    fn name(&self) -> &str;

    async fn get(&self, name: &str) -> Result<Vec<u8>, FsError>;

    async fn put(&self, name: &str, data: &[u8]) -> Result<(), FsError>;

    async fn delete(&self, name: &str) -> Result<(), FsError>;

    async fn rename(&self, old: &str, new: &str) -> Result<(), FsError>;

    async fn get_metadata(&self, name: &str) -> Result<ObjectMeta, FsError>;

    /// Available space in bytes.
    async fn free_space(&self) -> Result<u64, FsError>;

    /// Content digest using the provider's own algorithm; must match what
    /// the provider reports in [`ObjectMeta::hash`].
    fn compute_hash(&self, data: &[u8]) -> String;

    /// Acquire the advisory lock, waiting up to [`LOCK_TIMEOUT`].
    async fn lock(&self) -> Result<(), FsError> {
        acquire_lock(self, LOCK_TIMEOUT, LOCK_POLL).await
    }

    /// Release the advisory lock unconditionally.
    async fn unlock(&self) -> Result<(), FsError> {
        match self.delete(LOCK_OBJECT).await {
            Err(FsError::NotFound) => Ok(()),
            other => other,
        }
    }
}

/// Acquire the advisory lock on `drive`.
///
/// Creates the lock object if absent; otherwise polls with bounded backoff
/// until the holder releases it. If the lock is still present after
/// `timeout` it is treated as stale, force-deleted, and acquisition
/// restarts from the beginning once. A second timeout surfaces
/// [`FsError::Locked`].
pub async fn acquire_lock<D: Drive + ?Sized>(
    drive: &D,
    timeout: Duration,
    poll: Duration,
) -> Result<(), FsError> {
    for cycle in 0..2 {
        if try_acquire(drive, timeout, poll).await? {
            return Ok(());
        }

        warn!(
            drive = drive.name(),
            cycle, "remote lock exceeded timeout, breaking stale lock"
        );
        match drive.delete(LOCK_OBJECT).await {
            Ok(()) | Err(FsError::NotFound) => {}
            Err(e) => return Err(e),
        }
    }

    Err(FsError::Locked(drive.name().to_string()))
}

/// One acquisition cycle: `Ok(true)` when the lock was taken, `Ok(false)`
/// when the timeout elapsed with the lock still held.
async fn try_acquire<D: Drive + ?Sized>(
    drive: &D,
    timeout: Duration,
    poll: Duration,
) -> Result<bool, FsError> {
    let deadline = Instant::now() + timeout;
    let mut wait = poll;

    loop {
        match drive.get_metadata(LOCK_OBJECT).await {
            Err(FsError::NotFound) => {
                drive.put(LOCK_OBJECT, b"").await?;
                return Ok(true);
            }
            Ok(_) if Instant::now() >= deadline => return Ok(false),
            Ok(_) => {
                tokio::time::sleep(wait).await;
                wait = (wait * 2).min(LOCK_POLL_MAX);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Build the url recorded in the catalog for an object on `drive`.
pub fn make_url(drive: &dyn Drive, object: &str) -> String {
    format!("{}://{}", drive.name(), object.trim_start_matches('/'))
}

/// Split an object url into `(scheme, object name)`.
pub fn parse_url(url: &str) -> Result<(&str, &str), FsError> {
    url.split_once("://")
        .ok_or_else(|| FsError::Invalid(format!("malformed object url: {url}")))
}

/// Opaque remote name for a new object. Never derived from the
/// user-visible name, so nothing leaks and nothing collides.
pub fn generate_object_name() -> String {
    format!("{}.bin", Uuid::new_v4().simple())
}
