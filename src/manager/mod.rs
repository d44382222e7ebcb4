//! The manager: request router between the kernel bridge, the local cache
//! and the drives.
//!
//! Responsibilities:
//! - Bootstrap: discover (or create) the canonical catalog and pick the
//!   catalog drive.
//! - The filesystem operation set consumed by the kernel bridge.
//! - Placement of new file bodies on the drive with the most free space.
//! - The catalog synchronization protocol under the remote lock.
//! - Dirty tracking and the flush path used by the background flusher.
//!
//! Concurrency model: one readers-writer lock guards the catalog working
//! copy and the dirty set; per-inode mutexes serialize body I/O. Body bytes
//! never travel while the catalog lock is held exclusively, and the remote
//! lock is held only for the brief catalog round-trip.

pub mod flusher;


pub use flusher::Flusher;

use crate::cache::DiskCache;
use crate::catalog::store::ROOT_INODE;
use crate::catalog::{Catalog, CatalogEntry};
use crate::crypto::{Cipher, MasterKey};
use crate::drive::{
    CATALOG_OBJECT, Drive, LOCK_POLL, LOCK_TIMEOUT, ObjectMeta, acquire_lock, generate_object_name,
    make_url, parse_url,
};
use crate::error::{FsError, retry};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::{Mutex, RwLock, RwLockWriteGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DIVERGENCE_RETRIES: u32 = 3;
const TRANSFER_RETRIES: u32 = 3;

/// Sentinel recorded after a detected divergence so the next round-trip
/// always re-pulls the canonical copy.
const HASH_UNKNOWN: &str = "<diverged>";

#[derive(Clone, Debug)]
pub struct MountOptions {
    /// Directory holding the body cache and the catalog working copy.
    pub cache_dir: PathBuf,
    /// Flusher tick period.
    pub flush_interval: Duration,
    /// Remote-lock staleness timeout.
    pub lock_timeout: Duration,
    /// Initial remote-lock poll delay.
    pub lock_poll: Duration,
}

impl MountOptions {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            flush_interval: Duration::from_secs(5),
            lock_timeout: LOCK_TIMEOUT,
            lock_poll: LOCK_POLL,
        }
    }
}

/// Filesystem-wide statistics for `statfs`.
#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub files: u64,
    pub max_name_len: u32,
}

#[derive(Default)]
struct DirtyEntry {
    /// Bumped on every write so a flush can tell whether the body changed
    /// underneath it.
    generation: u64,
    attempts: u32,
    not_before: Option<Instant>,
    flushing: bool,
}

/// In-memory view guarded by the manager's readers-writer lock.
struct State {
    catalog: Catalog,
    /// Hash of the last catalog object we uploaded or downloaded.
    remote_hash: String,
    dirty: HashMap<i64, DirtyEntry>,
    next_generation: u64,
}

struct OpenHandle {
    inode: i64,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager").finish_non_exhaustive()
    }
}

pub struct Manager {
    drives: Vec<Arc<dyn Drive>>,
    catalog_drive: Arc<dyn Drive>,
    cipher: Cipher,
    cache: DiskCache,
    options: MountOptions,
    state: RwLock<State>,
    handles: DashMap<u64, OpenHandle>,
    next_fh: AtomicU64,
    body_locks: DashMap<i64, Arc<Mutex<()>>>,
    access: DashMap<i64, Instant>,
    shutting_down: AtomicBool,
}

impl Manager {
    /// Mount: discover or create the canonical catalog and build the
    /// manager around it. The encryption key is owned by the manager for
    /// its lifetime.
    pub async fn new(
        drives: Vec<Arc<dyn Drive>>,
        key: MasterKey,
        options: MountOptions,
    ) -> Result<Arc<Self>, FsError> {
        if drives.is_empty() {
            return Err(FsError::Invalid("at least one drive is required".into()));
        }

        let cipher = Cipher::new(key);
        let cache = DiskCache::new(&options.cache_dir).await?;
        let catalog_path = options.cache_dir.join(CATALOG_OBJECT);

        let mut found: Vec<(usize, ObjectMeta)> = Vec::new();
        for (i, drive) in drives.iter().enumerate() {
            match drive.get_metadata(CATALOG_OBJECT).await {
                Ok(meta) => found.push((i, meta)),
                Err(FsError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }

        let (catalog_drive, catalog, remote_hash) = if found.is_empty() {
            // first ever mount: the roomiest drive hosts the catalog
            let mut best: Option<(usize, u64)> = None;
            for (i, drive) in drives.iter().enumerate() {
                let free = drive.free_space().await?;
                if best.is_none_or(|(_, b)| free > b) {
                    best = Some((i, free));
                }
            }
            let (idx, _) = best.ok_or(FsError::NoSpace)?;
            let drive = drives[idx].clone();

            let catalog = Catalog::create(&catalog_path).await?;
            let plain = catalog.snapshot_bytes().await?;
            let ciphertext = cipher.encrypt(&plain)?;

            acquire_lock(drive.as_ref(), options.lock_timeout, options.lock_poll).await?;
            let put = drive.put(CATALOG_OBJECT, &ciphertext).await;
            let _ = drive.unlock().await;
            put?;

            let hash = drive.compute_hash(&ciphertext);
            info!(drive = drive.name(), "initialized fresh catalog");
            (drive, catalog, hash)
        } else {
            // several copies can exist after failovers: newest wins, the
            // others are overwritten by later flushes
            let mut newest: Option<(usize, ObjectMeta)> = None;
            for (i, meta) in found {
                let better = match &newest {
                    None => true,
                    Some((_, cur)) => {
                        meta.modified.unwrap_or(UNIX_EPOCH) > cur.modified.unwrap_or(UNIX_EPOCH)
                    }
                };
                if better {
                    newest = Some((i, meta));
                }
            }
            let (idx, meta) = newest.ok_or(FsError::NotFound)?;
            let drive = drives[idx].clone();

            let ciphertext = drive.get(CATALOG_OBJECT).await?;
            let plain = cipher.decrypt(&ciphertext)?;
            tokio::fs::write(&catalog_path, &plain).await?;

            let catalog = match Catalog::open(&catalog_path).await {
                Ok(c) => c,
                Err(_) => return Err(FsError::Corrupt),
            };
            if !catalog.validate().await {
                // refuse the mount; the remote copy is left untouched
                return Err(FsError::Corrupt);
            }

            info!(drive = drive.name(), "loaded existing catalog");
            (drive, catalog, meta.hash)
        };

        Ok(Arc::new(Self {
            drives,
            catalog_drive,
            cipher,
            cache,
            options,
            state: RwLock::new(State {
                catalog,
                remote_hash,
                dirty: HashMap::new(),
                next_generation: 0,
            }),
            handles: DashMap::new(),
            next_fh: AtomicU64::new(1),
            body_locks: DashMap::new(),
            access: DashMap::new(),
            shutting_down: AtomicBool::new(false),
        }))
    }

    pub fn flush_interval(&self) -> Duration {
        self.options.flush_interval
    }

    pub fn catalog_drive_name(&self) -> &str {
        self.catalog_drive.name()
    }

    // ---- namespace reads -------------------------------------------------

    pub async fn lookup(&self, parent: i64, name: &str) -> Result<CatalogEntry, FsError> {
        self.ensure_open()?;
        let st = self.state.read().await;
        st.catalog.search(parent, name).await
    }

    pub async fn get_attrs(&self, inode: i64) -> Result<CatalogEntry, FsError> {
        self.ensure_open()?;
        let st = self.state.read().await;
        st.catalog.get(inode).await
    }

    pub async fn read_dir(&self, inode: i64) -> Result<Vec<CatalogEntry>, FsError> {
        self.ensure_open()?;
        let st = self.state.read().await;
        let dir = st.catalog.get(inode).await?;
        if !dir.is_folder() {
            return Err(FsError::NotADirectory(inode));
        }
        st.catalog.get_children(inode).await
    }

    pub async fn statfs(&self) -> Result<StatFs, FsError> {
        self.ensure_open()?;
        let (files, used) = {
            let st = self.state.read().await;
            (st.catalog.file_count().await?, st.catalog.total_size().await?)
        };

        let mut free = 0u64;
        for drive in &self.drives {
            free += drive.free_space().await.unwrap_or(0);
        }

        let block_size = 4096u32;
        Ok(StatFs {
            block_size,
            total_blocks: (used + free) / block_size as u64,
            free_blocks: free / block_size as u64,
            files,
            max_name_len: 255,
        })
    }

    // ---- body I/O --------------------------------------------------------

    /// Open a file, materializing its body locally on first use.
    pub async fn open(&self, inode: i64) -> Result<u64, FsError> {
        self.ensure_open()?;
        let entry = {
            let st = self.state.read().await;
            st.catalog.get(inode).await?
        };
        if entry.is_folder() {
            return Err(FsError::IsADirectory(inode));
        }

        {
            let lock = self.body_lock(inode);
            let _guard = lock.lock().await;
            self.ensure_materialized(&entry).await?;
        }

        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(fh, OpenHandle { inode });
        self.access.insert(inode, Instant::now());
        Ok(fh)
    }

    pub async fn read(&self, fh: u64, offset: u64, len: usize) -> Result<Vec<u8>, FsError> {
        self.ensure_open()?;
        let inode = self.handle_inode(fh)?;
        let lock = self.body_lock(inode);
        let _guard = lock.lock().await;
        let data = self.cache.read_at(inode, offset, len).await?;
        self.access.insert(inode, Instant::now());
        Ok(data)
    }

    pub async fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        self.ensure_open()?;
        let inode = self.handle_inode(fh)?;
        let new_len = {
            let lock = self.body_lock(inode);
            let _guard = lock.lock().await;
            self.cache.write_at(inode, offset, data).await?
        };
        self.mark_dirty(inode, new_len).await?;
        Ok(data.len())
    }

    pub async fn truncate(&self, inode: i64, size: u64) -> Result<(), FsError> {
        self.ensure_open()?;
        let entry = {
            let st = self.state.read().await;
            st.catalog.get(inode).await?
        };
        if entry.is_folder() {
            return Err(FsError::IsADirectory(inode));
        }

        {
            let lock = self.body_lock(inode);
            let _guard = lock.lock().await;
            self.ensure_materialized(&entry).await?;
            self.cache.truncate(inode, size).await?;
        }
        self.mark_dirty(inode, size).await
    }

    pub async fn release(&self, fh: u64) -> Result<(), FsError> {
        self.handles
            .remove(&fh)
            .map(|_| ())
            .ok_or(FsError::BadHandle(fh))
    }

    // ---- namespace writes ------------------------------------------------

    pub async fn mkdir(&self, parent: i64, name: &str, mode: u32) -> Result<CatalogEntry, FsError> {
        self.ensure_open()?;
        self.with_divergence_retry(|| self.try_mkdir(parent, name, mode))
            .await
    }

    pub async fn create(
        &self,
        parent: i64,
        name: &str,
        mode: u32,
    ) -> Result<CatalogEntry, FsError> {
        self.ensure_open()?;
        let entry = self
            .with_divergence_retry(|| self.try_create(parent, name, mode))
            .await?;
        // new files start with an empty local body
        self.cache.materialize(entry.inode, &[]).await?;
        self.access.insert(entry.inode, Instant::now());
        Ok(entry)
    }

    pub async fn unlink(&self, inode: i64) -> Result<(), FsError> {
        self.ensure_open()?;
        let entry = self
            .with_divergence_retry(|| self.try_unlink(inode))
            .await?;

        // local and remote cleanup is best effort once the row is gone
        {
            let mut st = self.state.write().await;
            st.dirty.remove(&inode);
        }
        self.access.remove(&inode);
        let _ = self.cache.invalidate(inode).await;

        if !entry.url.is_empty() {
            if let Ok((scheme, object)) = parse_url(&entry.url) {
                if let Ok(drive) = self.drive_by_scheme(scheme) {
                    match drive.delete(object).await {
                        Ok(()) | Err(FsError::NotFound) => {}
                        Err(e) => {
                            warn!(inode, url = %entry.url, error = %e, "could not delete remote object")
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn rmdir(&self, inode: i64) -> Result<(), FsError> {
        self.ensure_open()?;
        self.with_divergence_retry(|| self.try_rmdir(inode)).await
    }

    pub async fn rename(
        &self,
        inode: i64,
        new_parent: i64,
        new_name: &str,
    ) -> Result<CatalogEntry, FsError> {
        self.ensure_open()?;
        self.with_divergence_retry(|| self.try_rename(inode, new_parent, new_name))
            .await
    }

    // ---- write-path attempts (one catalog round-trip each) ---------------

    async fn try_mkdir(
        &self,
        parent: i64,
        name: &str,
        mode: u32,
    ) -> Result<CatalogEntry, FsError> {
        let txn = self.begin_commit().await?;
        let entry = match txn.catalog().add_directory(parent, name, mode).await {
            Ok(e) => e,
            Err(e) => {
                txn.abort().await;
                return Err(e);
            }
        };
        txn.commit().await?;
        Ok(entry)
    }

    async fn try_create(
        &self,
        parent: i64,
        name: &str,
        mode: u32,
    ) -> Result<CatalogEntry, FsError> {
        // placement happens before the lock: the roomiest drive right now
        let drive = self.placement_drive().await?;
        let url = make_url(drive.as_ref(), &generate_object_name());

        let txn = self.begin_commit().await?;
        let entry = match txn.catalog().create_file(parent, name, mode, &url, "").await {
            Ok(e) => e,
            Err(e) => {
                txn.abort().await;
                return Err(e);
            }
        };
        txn.commit().await?;
        debug!(inode = entry.inode, url = %url, "created file");
        Ok(entry)
    }

    async fn try_unlink(&self, inode: i64) -> Result<CatalogEntry, FsError> {
        let txn = self.begin_commit().await?;
        let entry = match txn.catalog().get(inode).await {
            Ok(e) => e,
            Err(e) => {
                txn.abort().await;
                return Err(e);
            }
        };
        if entry.is_folder() {
            txn.abort().await;
            return Err(FsError::IsADirectory(inode));
        }
        if let Err(e) = txn.catalog().delete(inode).await {
            txn.abort().await;
            return Err(e);
        }
        txn.commit().await?;
        Ok(entry)
    }

    async fn try_rmdir(&self, inode: i64) -> Result<(), FsError> {
        if inode == ROOT_INODE {
            return Err(FsError::Invalid("cannot remove the root directory".into()));
        }
        let txn = self.begin_commit().await?;
        let entry = match txn.catalog().get(inode).await {
            Ok(e) => e,
            Err(e) => {
                txn.abort().await;
                return Err(e);
            }
        };
        if !entry.is_folder() {
            txn.abort().await;
            return Err(FsError::NotADirectory(inode));
        }
        match txn.catalog().get_children(inode).await {
            Ok(children) if !children.is_empty() => {
                txn.abort().await;
                return Err(FsError::NotEmpty(inode));
            }
            Ok(_) => {}
            Err(e) => {
                txn.abort().await;
                return Err(e);
            }
        }
        if let Err(e) = txn.catalog().delete(inode).await {
            txn.abort().await;
            return Err(e);
        }
        txn.commit().await
    }

    async fn try_rename(
        &self,
        inode: i64,
        new_parent: i64,
        new_name: &str,
    ) -> Result<CatalogEntry, FsError> {
        if inode == ROOT_INODE {
            return Err(FsError::Invalid("cannot rename the root directory".into()));
        }
        let txn = self.begin_commit().await?;

        let mut entry = match txn.catalog().get(inode).await {
            Ok(e) => e,
            Err(e) => {
                txn.abort().await;
                return Err(e);
            }
        };

        match txn.catalog().get(new_parent).await {
            Ok(p) if !p.is_folder() => {
                txn.abort().await;
                return Err(FsError::NotADirectory(new_parent));
            }
            Ok(_) => {}
            Err(e) => {
                txn.abort().await;
                return Err(e);
            }
        }

        match txn.catalog().search(new_parent, new_name).await {
            Ok(existing) if existing.inode == inode => {
                // renaming onto itself is a no-op
                txn.abort().await;
                return Ok(entry);
            }
            Ok(_) => {
                txn.abort().await;
                return Err(FsError::Conflict {
                    parent: new_parent,
                    name: new_name.to_string(),
                });
            }
            Err(FsError::NotFound) => {}
            Err(e) => {
                txn.abort().await;
                return Err(e);
            }
        }

        // a folder must not move into its own subtree
        if entry.is_folder() {
            let mut cursor = new_parent;
            while cursor != 0 {
                if cursor == inode {
                    txn.abort().await;
                    return Err(FsError::Invalid(
                        "cannot move a directory into itself".into(),
                    ));
                }
                cursor = match txn.catalog().get(cursor).await {
                    Ok(e) => e.parent,
                    Err(e) => {
                        txn.abort().await;
                        return Err(e);
                    }
                };
            }
        }

        entry.parent = new_parent;
        entry.name = new_name.to_string();
        if let Err(e) = txn.catalog().update(&entry).await {
            txn.abort().await;
            return Err(e);
        }
        txn.commit().await?;
        Ok(entry)
    }

    // ---- flush path ------------------------------------------------------

    /// Flush one dirty inode: body to its drive, then size and hash into
    /// the catalog under the remote lock. Clears the dirty flag only if the
    /// body did not change while the flush was in flight.
    pub async fn flush_inode(&self, inode: i64) -> Result<(), FsError> {
        let generation = {
            let mut st = self.state.write().await;
            match st.dirty.get_mut(&inode) {
                None => return Ok(()),
                Some(d) if d.flushing => return Ok(()),
                Some(d) => {
                    d.flushing = true;
                    d.generation
                }
            }
        };

        let result = self.flush_body(inode).await;

        let mut st = self.state.write().await;
        let clear = match (st.dirty.get_mut(&inode), &result) {
            (None, _) => false,
            (Some(d), Ok(())) if d.generation == generation => true,
            (Some(d), Ok(())) => {
                // re-dirtied while uploading; the next tick flushes again
                d.flushing = false;
                false
            }
            (Some(d), Err(_)) => {
                d.flushing = false;
                d.attempts += 1;
                d.not_before = Some(Instant::now() + flush_backoff(d.attempts));
                false
            }
        };
        if clear {
            st.dirty.remove(&inode);
        }
        result
    }

    async fn flush_body(&self, inode: i64) -> Result<(), FsError> {
        let entry = {
            let st = self.state.read().await;
            match st.catalog.get(inode).await {
                Ok(e) => e,
                // unlinked while dirty: nothing left to upload
                Err(FsError::NotFound) => return Ok(()),
                Err(e) => return Err(e),
            }
        };

        let plain = {
            let lock = self.body_lock(inode);
            let _guard = lock.lock().await;
            self.cache.read_all(inode).await?
        };

        // replayed rows may arrive without a url; place them now
        let url = if entry.url.is_empty() {
            let drive = self.placement_drive().await?;
            make_url(drive.as_ref(), &generate_object_name())
        } else {
            entry.url.clone()
        };

        let (scheme, object) = parse_url(&url)?;
        let drive = self.drive_by_scheme(scheme)?;
        let object = object.to_string();

        // body upload stays outside the remote lock
        let ciphertext = self.cipher.encrypt(&plain)?;
        retry(TRANSFER_RETRIES, || drive.put(&object, &ciphertext)).await?;
        let hash = drive.compute_hash(&ciphertext);

        let size = plain.len() as i64;
        self.with_divergence_retry(|| async {
            let txn = self.begin_commit().await?;
            let mut row = match txn.catalog().get(inode).await {
                Ok(r) => r,
                Err(FsError::NotFound) => {
                    txn.abort().await;
                    return Ok(());
                }
                Err(e) => {
                    txn.abort().await;
                    return Err(e);
                }
            };
            row.size = size;
            row.url = url.clone();
            row.hash = hash.clone();
            if let Err(e) = txn.catalog().update(&row).await {
                txn.abort().await;
                return Err(e);
            }
            txn.commit().await
        })
        .await?;

        debug!(inode, bytes = plain.len(), url = %url, "flushed body");
        Ok(())
    }

    /// Flush every dirty inode whose backoff window has passed.
    pub async fn flush_due(&self) {
        let now = Instant::now();
        let due: Vec<i64> = {
            let st = self.state.read().await;
            st.dirty
                .iter()
                .filter(|(_, d)| !d.flushing && d.not_before.is_none_or(|t| t <= now))
                .map(|(inode, _)| *inode)
                .collect()
        };
        for inode in due {
            if let Err(e) = self.flush_inode(inode).await {
                warn!(inode, error = %e, "flush failed, will retry");
            }
        }
    }

    /// Flush everything dirty, ignoring backoff windows. Used by the final
    /// drain on shutdown.
    pub async fn flush_all(&self) {
        let dirty: Vec<i64> = {
            let st = self.state.read().await;
            st.dirty.keys().copied().collect()
        };
        for inode in dirty {
            if let Err(e) = self.flush_inode(inode).await {
                warn!(inode, error = %e, "flush failed during drain");
            }
        }
    }

    pub async fn dirty_count(&self) -> usize {
        self.state.read().await.dirty.len()
    }

    /// Stop accepting operations and drain dirty state within `deadline`.
    ///
    /// The remote lock is scoped to individual catalog round-trips, so
    /// there is never a lock left to release here even when the deadline
    /// expires mid-drain.
    pub async fn shutdown(&self, deadline: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if tokio::time::timeout(deadline, self.flush_all()).await.is_err() {
            warn!("shutdown deadline expired, abandoning remaining uploads");
        }
    }

    /// Evict clean cached bodies, oldest first, until at most `max_bytes`
    /// remain. Dirty bodies and open files are never evicted.
    pub async fn evict_clean(&self, max_bytes: u64) -> Result<(), FsError> {
        let mut stamped: Vec<(i64, Instant)> =
            self.access.iter().map(|e| (*e.key(), *e.value())).collect();
        stamped.sort_by_key(|(_, stamp)| *stamp);

        let mut total = 0u64;
        let mut sizes = HashMap::new();
        for (inode, _) in &stamped {
            if self.cache.contains(*inode).await {
                let len = self.cache.len(*inode).await.unwrap_or(0);
                sizes.insert(*inode, len);
                total += len;
            }
        }

        let pinned: HashSet<i64> = {
            let st = self.state.read().await;
            st.dirty
                .keys()
                .copied()
                .chain(self.handles.iter().map(|h| h.inode))
                .collect()
        };

        for (inode, _) in stamped {
            if total <= max_bytes {
                break;
            }
            if pinned.contains(&inode) {
                continue;
            }
            if let Some(len) = sizes.get(&inode) {
                self.cache.invalidate(inode).await?;
                self.access.remove(&inode);
                total -= len;
            }
        }
        Ok(())
    }

    // ---- internals -------------------------------------------------------

    fn ensure_open(&self) -> Result<(), FsError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(FsError::Canceled);
        }
        Ok(())
    }

    fn handle_inode(&self, fh: u64) -> Result<i64, FsError> {
        self.handles
            .get(&fh)
            .map(|h| h.inode)
            .ok_or(FsError::BadHandle(fh))
    }

    fn body_lock(&self, inode: i64) -> Arc<Mutex<()>> {
        self.body_locks
            .entry(inode)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn drive_by_scheme(&self, scheme: &str) -> Result<Arc<dyn Drive>, FsError> {
        self.drives
            .iter()
            .find(|d| d.name() == scheme)
            .cloned()
            .ok_or_else(|| FsError::Invalid(format!("no enabled backend for scheme {scheme}")))
    }

    /// The drive with the greatest reported free space right now. The
    /// catalog drive competes like any other.
    async fn placement_drive(&self) -> Result<Arc<dyn Drive>, FsError> {
        let mut best: Option<(usize, u64)> = None;
        for (i, drive) in self.drives.iter().enumerate() {
            let free = match drive.free_space().await {
                Ok(free) => free,
                Err(e) => {
                    warn!(drive = drive.name(), error = %e, "free space probe failed");
                    continue;
                }
            };
            if best.is_none_or(|(_, b)| free > b) {
                best = Some((i, free));
            }
        }
        match best {
            Some((_, 0)) | None => Err(FsError::NoSpace),
            Some((idx, _)) => Ok(self.drives[idx].clone()),
        }
    }

    /// Materialize a file body into the cache if it is not already there.
    /// Caller holds the per-inode body lock.
    async fn ensure_materialized(&self, entry: &CatalogEntry) -> Result<(), FsError> {
        if self.cache.contains(entry.inode).await {
            return Ok(());
        }
        if entry.url.is_empty() || entry.hash.is_empty() {
            // never uploaded: the body starts empty
            self.cache.materialize(entry.inode, &[]).await
        } else {
            let (scheme, object) = parse_url(&entry.url)?;
            let drive = self.drive_by_scheme(scheme)?;
            let object = object.to_string();
            let ciphertext = retry(TRANSFER_RETRIES, || drive.get(&object)).await?;
            let plain = self.cipher.decrypt(&ciphertext)?;
            self.cache.materialize(entry.inode, &plain).await
        }
    }

    async fn mark_dirty(&self, inode: i64, new_len: u64) -> Result<(), FsError> {
        let mut st = self.state.write().await;

        // keep the catalog's size current even before the body flushes
        let mut entry = st.catalog.get(inode).await?;
        if entry.size != new_len as i64 {
            entry.size = new_len as i64;
            st.catalog.update(&entry).await?;
        }

        st.next_generation += 1;
        let generation = st.next_generation;
        let d = st.dirty.entry(inode).or_default();
        d.generation = generation;
        d.not_before = None;

        self.access.insert(inode, Instant::now());
        Ok(())
    }

    async fn with_divergence_retry<F, Fut, T>(&self, mut op: F) -> Result<T, FsError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FsError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Err(FsError::Diverged) if attempt + 1 < DIVERGENCE_RETRIES => {
                    debug!(attempt, "remote catalog diverged, re-pulling");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Open a catalog round-trip: take the remote lock, then refresh the
    /// working copy if the canonical one moved.
    async fn begin_commit(&self) -> Result<CatalogTxn<'_>, FsError> {
        let state = self.state.write().await;
        acquire_lock(
            self.catalog_drive.as_ref(),
            self.options.lock_timeout,
            self.options.lock_poll,
        )
        .await?;

        let mut state = state;
        match self.refresh_locked(&mut state).await {
            Ok(refreshed_hash) => Ok(CatalogTxn {
                mgr: self,
                state,
                refreshed_hash,
            }),
            Err(e) => {
                let _ = self.catalog_drive.unlock().await;
                Err(e)
            }
        }
    }

    async fn refresh_locked(&self, state: &mut State) -> Result<String, FsError> {
        match self.catalog_drive.get_metadata(CATALOG_OBJECT).await {
            Ok(meta) => {
                if meta.hash != state.remote_hash {
                    debug!("remote catalog changed, replacing working copy");
                    let ciphertext = self.catalog_drive.get(CATALOG_OBJECT).await?;
                    let plain = self.cipher.decrypt(&ciphertext)?;
                    state.catalog.replace_with(&plain).await?;
                    if !state.catalog.validate().await {
                        return Err(FsError::Corrupt);
                    }
                    state.remote_hash = meta.hash.clone();
                }
                Ok(meta.hash)
            }
            // catalog missing remotely; commit will recreate it
            Err(FsError::NotFound) => Ok(String::new()),
            Err(e) => Err(e),
        }
    }
}

/// An open catalog round-trip: the remote lock is held and the working
/// copy is fresh. `commit` uploads the catalog and releases the lock;
/// `abort` just releases the lock.
struct CatalogTxn<'a> {
    mgr: &'a Manager,
    state: RwLockWriteGuard<'a, State>,
    /// Remote object hash observed at refresh; empty when absent.
    refreshed_hash: String,
}

impl CatalogTxn<'_> {
    fn catalog(&self) -> &Catalog {
        &self.state.catalog
    }

    async fn commit(mut self) -> Result<(), FsError> {
        let res = self.commit_inner().await;
        let _ = self.mgr.catalog_drive.unlock().await;
        res
    }

    async fn commit_inner(&mut self) -> Result<(), FsError> {
        // upload only if nobody slipped a new catalog in outside the lock
        // protocol
        match self.mgr.catalog_drive.get_metadata(CATALOG_OBJECT).await {
            Ok(meta) if meta.hash != self.refreshed_hash => {
                self.state.remote_hash = HASH_UNKNOWN.to_string();
                return Err(FsError::Diverged);
            }
            Err(FsError::NotFound) if !self.refreshed_hash.is_empty() => {
                self.state.remote_hash = HASH_UNKNOWN.to_string();
                return Err(FsError::Diverged);
            }
            Ok(_) | Err(FsError::NotFound) => {}
            Err(e) => return Err(e),
        }

        let plain = self.state.catalog.snapshot_bytes().await?;
        let ciphertext = self.mgr.cipher.encrypt(&plain)?;
        retry(TRANSFER_RETRIES, || {
            self.mgr.catalog_drive.put(CATALOG_OBJECT, &ciphertext)
        })
        .await?;
        self.state.remote_hash = self.mgr.catalog_drive.compute_hash(&ciphertext);
        Ok(())
    }

    async fn abort(self) {
        let _ = self.mgr.catalog_drive.unlock().await;
    }
}

fn flush_backoff(attempts: u32) -> Duration {
    Duration::from_millis(500 * (1u64 << attempts.min(7)))
}
