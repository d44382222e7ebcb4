//! Row-level operations on the catalog working copy.

use crate::catalog::entry::{self, CatalogEntry, EntryKind};
use crate::error::FsError;
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

type Files = entry::Entity;
type Column = entry::Column;

/// Inode of the root directory; present in every catalog.
pub const ROOT_INODE: i64 = 1;

/// The schema is created verbatim so the on-disk artifact stays compatible
/// across mounts. AUTOINCREMENT guarantees inodes are never reused within a
/// catalog's lifetime, even after deletes.
const CREATE_FILES_TABLE: &str = r#"CREATE TABLE IF NOT EXISTS files (
    "inode"  INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    "name"   TEXT NOT NULL,
    "url"    TEXT NOT NULL DEFAULT '',
    "size"   INTEGER NOT NULL DEFAULT 0,
    "mode"   INTEGER NOT NULL,
    "parent" INTEGER NOT NULL,
    "type"   INTEGER NOT NULL,
    "hash"   TEXT NOT NULL DEFAULT '',
    UNIQUE("name", "parent")
);"#;

/// The catalog working copy: a SQLite file plus its open connection.
pub struct Catalog {
    db: DatabaseConnection,
    path: PathBuf,
}

impl Catalog {
    /// Create a fresh catalog at `path`: schema plus the root row.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, FsError> {
        let path = path.as_ref().to_path_buf();
        // start from a clean slate
        let _ = tokio::fs::remove_file(&path).await;

        let db = Self::connect(&path).await?;
        db.execute_unprepared(CREATE_FILES_TABLE).await?;
        // root folder, mode 0755
        db.execute_unprepared(&format!(
            "INSERT INTO files(inode, name, mode, parent, type) VALUES (1, '', {}, 0, {});",
            0o755,
            EntryKind::Folder as i32,
        ))
        .await?;

        info!(path = %path.display(), "created fresh catalog");
        Ok(Self { db, path })
    }

    /// Open an existing catalog file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, FsError> {
        let path = path.as_ref().to_path_buf();
        let db = Self::connect(&path).await?;
        Ok(Self { db, path })
    }

    async fn connect(path: &Path) -> Result<DatabaseConnection, FsError> {
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let mut opts = ConnectOptions::new(url);
        opts.max_connections(1).min_connections(1).sqlx_logging(false);
        let db = Database::connect(opts).await?;
        // the catalog must stay a single self-contained file for transport
        db.execute_unprepared("PRAGMA journal_mode = DELETE;").await?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Schema probe: true iff the `files` table is queryable.
    pub async fn validate(&self) -> bool {
        Files::find().limit(1).all(&self.db).await.is_ok()
    }

    /// Serialized working copy, for transport.
    pub async fn snapshot_bytes(&self) -> Result<Vec<u8>, FsError> {
        Ok(tokio::fs::read(&self.path).await?)
    }

    /// Replace the working copy with downloaded catalog bytes.
    ///
    /// The connection is closed first so SQLite releases the file before it
    /// is overwritten.
    pub async fn replace_with(&mut self, bytes: &[u8]) -> Result<(), FsError> {
        let stale = std::mem::take(&mut self.db);
        stale.close().await?;
        tokio::fs::write(&self.path, bytes).await?;
        self.db = Self::connect(&self.path).await?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "replaced catalog working copy");
        Ok(())
    }

    pub async fn close(self) -> Result<(), FsError> {
        Ok(self.db.close().await?)
    }

    /// Look up an entry by name under a parent. Canonical parameter order
    /// is `(parent, name)`.
    pub async fn search(&self, parent: i64, name: &str) -> Result<CatalogEntry, FsError> {
        let model = Files::find()
            .filter(Column::Parent.eq(parent))
            .filter(Column::Name.eq(name))
            .one(&self.db)
            .await?
            .ok_or(FsError::NotFound)?;
        self.with_nlink(model).await
    }

    pub async fn get(&self, inode: i64) -> Result<CatalogEntry, FsError> {
        let model = Files::find_by_id(inode)
            .one(&self.db)
            .await?
            .ok_or(FsError::NotFound)?;
        self.with_nlink(model).await
    }

    pub async fn get_children(&self, parent: i64) -> Result<Vec<CatalogEntry>, FsError> {
        let models = Files::find()
            .filter(Column::Parent.eq(parent))
            .order_by_asc(Column::Name)
            .all(&self.db)
            .await?;

        let mut entries = Vec::with_capacity(models.len());
        for model in models {
            entries.push(self.with_nlink(model).await?);
        }
        Ok(entries)
    }

    pub async fn add_directory(
        &self,
        parent: i64,
        name: &str,
        mode: u32,
    ) -> Result<CatalogEntry, FsError> {
        self.check_parent(parent).await?;
        self.check_vacant(parent, name).await?;

        let row = entry::ActiveModel {
            name: Set(name.to_string()),
            url: Set(String::new()),
            size: Set(0),
            mode: Set(mode as i32),
            parent: Set(parent),
            kind: Set(EntryKind::Folder),
            hash: Set(String::new()),
            ..Default::default()
        };
        let model = row.insert(&self.db).await?;

        // freshly created, so only '.' and '..'
        Ok(CatalogEntry::from_model(model, 2))
    }

    pub async fn create_file(
        &self,
        parent: i64,
        name: &str,
        mode: u32,
        url: &str,
        hash: &str,
    ) -> Result<CatalogEntry, FsError> {
        self.check_parent(parent).await?;
        self.check_vacant(parent, name).await?;

        let row = entry::ActiveModel {
            name: Set(name.to_string()),
            url: Set(url.to_string()),
            size: Set(0),
            mode: Set(mode as i32),
            parent: Set(parent),
            kind: Set(EntryKind::File),
            hash: Set(hash.to_string()),
            ..Default::default()
        };
        let model = row.insert(&self.db).await?;

        Ok(CatalogEntry::from_model(model, 1))
    }

    pub async fn update(&self, entry: &CatalogEntry) -> Result<(), FsError> {
        match entry.to_active_model().update(&self.db).await {
            Ok(_) => Ok(()),
            Err(sea_orm::DbErr::RecordNotUpdated) => Err(FsError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, inode: i64) -> Result<(), FsError> {
        let res = Files::delete_by_id(inode).exec(&self.db).await?;
        if res.rows_affected == 0 {
            return Err(FsError::NotFound);
        }
        Ok(())
    }

    /// Insert a row, letting the catalog assign the inode.
    pub async fn insert(&self, entry: &CatalogEntry) -> Result<CatalogEntry, FsError> {
        self.check_vacant(entry.parent, &entry.name).await?;
        let model = entry.to_new_active_model().insert(&self.db).await?;
        let nlink = entry.nlink;
        Ok(CatalogEntry::from_model(model, nlink))
    }

    /// Insert a row preserving its inode. Only used when replaying
    /// externally-originated rows, never on the fast path.
    pub async fn force_insert(&self, entry: &CatalogEntry) -> Result<(), FsError> {
        self.check_vacant(entry.parent, &entry.name).await?;
        entry.to_active_model().insert(&self.db).await?;
        Ok(())
    }

    pub async fn row_count(&self) -> Result<u64, FsError> {
        Ok(Files::find().count(&self.db).await?)
    }

    pub async fn file_count(&self) -> Result<u64, FsError> {
        Ok(Files::find()
            .filter(Column::Kind.eq(EntryKind::File))
            .count(&self.db)
            .await?)
    }

    /// Sum of file sizes in bytes.
    pub async fn total_size(&self) -> Result<u64, FsError> {
        let total: Option<Option<i64>> = Files::find()
            .select_only()
            .column_as(Column::Size.sum(), "total")
            .filter(Column::Kind.eq(EntryKind::File))
            .into_tuple::<Option<i64>>()
            .one(&self.db)
            .await?;
        Ok(total.flatten().unwrap_or(0).max(0) as u64)
    }

    async fn check_parent(&self, parent: i64) -> Result<(), FsError> {
        let row = Files::find_by_id(parent)
            .one(&self.db)
            .await?
            .ok_or(FsError::NotFound)?;
        if row.kind != EntryKind::Folder {
            return Err(FsError::NotADirectory(parent));
        }
        Ok(())
    }

    async fn check_vacant(&self, parent: i64, name: &str) -> Result<(), FsError> {
        let existing = Files::find()
            .filter(Column::Parent.eq(parent))
            .filter(Column::Name.eq(name))
            .one(&self.db)
            .await?;
        if existing.is_some() {
            return Err(FsError::Conflict {
                parent,
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn with_nlink(&self, model: entry::Model) -> Result<CatalogEntry, FsError> {
        let nlink = match model.kind {
            EntryKind::File => 1,
            EntryKind::Folder => {
                let child_folders = Files::find()
                    .filter(Column::Parent.eq(model.inode))
                    .filter(Column::Kind.eq(EntryKind::Folder))
                    .count(&self.db)
                    .await?;
                // '.' and '..' on top of child folders
                child_folders as u32 + 2
            }
        };
        Ok(CatalogEntry::from_model(model, nlink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fresh() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::create(dir.path().join("cloudstash.db"))
            .await
            .unwrap();
        (dir, catalog)
    }

    #[tokio::test]
    async fn fresh_catalog_has_root() {
        let (_dir, catalog) = fresh().await;

        let root = catalog.get(ROOT_INODE).await.unwrap();
        assert_eq!(root.inode, 1);
        assert_eq!(root.name, "");
        assert_eq!(root.parent, 0);
        assert_eq!(root.mode, 0o755);
        assert!(root.is_folder());
        assert_eq!(root.nlink, 2);

        assert!(catalog.validate().await);
        assert_eq!(catalog.row_count().await.unwrap(), 1);
        assert_eq!(catalog.file_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn inodes_are_monotonic_and_never_reused() {
        let (_dir, catalog) = fresh().await;

        let a = catalog
            .create_file(ROOT_INODE, "a", 0o644, "mem://a.bin", "")
            .await
            .unwrap();
        let b = catalog
            .create_file(ROOT_INODE, "b", 0o644, "mem://b.bin", "")
            .await
            .unwrap();
        assert_eq!(a.inode, 2);
        assert_eq!(b.inode, 3);

        catalog.delete(b.inode).await.unwrap();
        let c = catalog
            .create_file(ROOT_INODE, "c", 0o644, "mem://c.bin", "")
            .await
            .unwrap();
        // AUTOINCREMENT: the freed inode 3 is not handed out again
        assert!(c.inode > b.inode);
    }

    #[tokio::test]
    async fn duplicate_names_conflict() {
        let (_dir, catalog) = fresh().await;

        catalog
            .add_directory(ROOT_INODE, "docs", 0o755)
            .await
            .unwrap();
        let err = catalog
            .add_directory(ROOT_INODE, "docs", 0o755)
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::Conflict { .. }));

        // the same name under a different parent is fine
        let sub = catalog.search(ROOT_INODE, "docs").await.unwrap();
        catalog
            .add_directory(sub.inode, "docs", 0o755)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn search_binds_parent_then_name() {
        let (_dir, catalog) = fresh().await;

        let dir = catalog
            .add_directory(ROOT_INODE, "inner", 0o755)
            .await
            .unwrap();
        catalog
            .create_file(dir.inode, "x", 0o644, "mem://x.bin", "")
            .await
            .unwrap();

        assert!(catalog.search(dir.inode, "x").await.is_ok());
        assert!(matches!(
            catalog.search(ROOT_INODE, "x").await,
            Err(FsError::NotFound)
        ));
    }

    #[tokio::test]
    async fn nlink_counts_child_folders() {
        let (_dir, catalog) = fresh().await;

        let top = catalog
            .add_directory(ROOT_INODE, "top", 0o755)
            .await
            .unwrap();
        catalog.add_directory(top.inode, "a", 0o755).await.unwrap();
        catalog.add_directory(top.inode, "b", 0o755).await.unwrap();
        catalog
            .create_file(top.inode, "f", 0o644, "mem://f.bin", "")
            .await
            .unwrap();

        let top = catalog.get(top.inode).await.unwrap();
        assert_eq!(top.nlink, 4); // '.' + '..' + two child folders

        let f = catalog.search(top.inode, "f").await.unwrap();
        assert_eq!(f.nlink, 1);

        let children = catalog.get_children(top.inode).await.unwrap();
        assert_eq!(children.len(), 3);
    }

    #[tokio::test]
    async fn force_insert_preserves_inode() {
        let (_dir, catalog) = fresh().await;

        let replayed = CatalogEntry {
            inode: 42,
            name: "replayed".to_string(),
            url: "mem://r.bin".to_string(),
            size: 7,
            mode: 0o644,
            parent: ROOT_INODE,
            kind: EntryKind::File,
            hash: "abc".to_string(),
            nlink: 1,
        };
        catalog.force_insert(&replayed).await.unwrap();

        let got = catalog.get(42).await.unwrap();
        assert_eq!(got.name, "replayed");
        assert_eq!(got.size, 7);

        // autoincrement continues past the replayed inode
        let next = catalog
            .create_file(ROOT_INODE, "next", 0o644, "mem://n.bin", "")
            .await
            .unwrap();
        assert!(next.inode > 42);
    }

    #[tokio::test]
    async fn totals_track_file_sizes() {
        let (_dir, catalog) = fresh().await;

        let mut a = catalog
            .create_file(ROOT_INODE, "a", 0o644, "mem://a.bin", "")
            .await
            .unwrap();
        a.size = 100;
        catalog.update(&a).await.unwrap();

        let mut b = catalog
            .create_file(ROOT_INODE, "b", 0o644, "mem://b.bin", "")
            .await
            .unwrap();
        b.size = 23;
        catalog.update(&b).await.unwrap();

        assert_eq!(catalog.total_size().await.unwrap(), 123);
        assert_eq!(catalog.file_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn replace_with_swaps_contents() {
        let dir = tempfile::tempdir().unwrap();
        let first = Catalog::create(dir.path().join("first.db")).await.unwrap();
        first
            .create_file(ROOT_INODE, "only-in-first", 0o644, "mem://1.bin", "")
            .await
            .unwrap();
        let bytes = first.snapshot_bytes().await.unwrap();
        first.close().await.unwrap();

        let mut second = Catalog::create(dir.path().join("second.db")).await.unwrap();
        second
            .add_directory(ROOT_INODE, "only-in-second", 0o755)
            .await
            .unwrap();

        second.replace_with(&bytes).await.unwrap();
        assert!(second.validate().await);
        assert!(second.search(ROOT_INODE, "only-in-first").await.is_ok());
        assert!(matches!(
            second.search(ROOT_INODE, "only-in-second").await,
            Err(FsError::NotFound)
        ));
    }

    #[tokio::test]
    async fn validate_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-db");
        tokio::fs::write(&path, b"certainly not sqlite")
            .await
            .unwrap();

        match Catalog::open(&path).await {
            Err(_) => {}
            Ok(catalog) => assert!(!catalog.validate().await),
        }
    }
}
