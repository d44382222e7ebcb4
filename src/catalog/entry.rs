//! Row model for the `files` table.

use sea_orm::entity::prelude::*;
use sea_orm::ActiveValue::{NotSet, Set};
use serde::{Deserialize, Serialize};

/// Entry type stored in the `type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "i32", db_type = "Integer")]
pub enum EntryKind {
    File = 1,
    Folder = 2,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "files")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub inode: i64,

    pub name: String,

    pub url: String,

    pub size: i64,

    pub mode: i32,

    pub parent: i64,

    #[sea_orm(column_name = "type")]
    pub kind: EntryKind,

    pub hash: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// A catalog row plus the derived link count.
///
/// `nlink` is computed on every read: 1 for files, 2 + number of child
/// folders for folders. It is never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub inode: i64,
    pub name: String,
    pub url: String,
    pub size: i64,
    pub mode: u32,
    pub parent: i64,
    pub kind: EntryKind,
    pub hash: String,
    pub nlink: u32,
}

impl CatalogEntry {
    pub(crate) fn from_model(model: Model, nlink: u32) -> Self {
        Self {
            inode: model.inode,
            name: model.name,
            url: model.url,
            size: model.size,
            mode: model.mode as u32,
            parent: model.parent,
            kind: model.kind,
            hash: model.hash,
            nlink,
        }
    }

    pub(crate) fn to_active_model(&self) -> ActiveModel {
        ActiveModel {
            inode: Set(self.inode),
            name: Set(self.name.clone()),
            url: Set(self.url.clone()),
            size: Set(self.size),
            mode: Set(self.mode as i32),
            parent: Set(self.parent),
            kind: Set(self.kind),
            hash: Set(self.hash.clone()),
        }
    }

    /// Active model without the inode, for autoincrement assignment.
    pub(crate) fn to_new_active_model(&self) -> ActiveModel {
        let mut am = self.to_active_model();
        am.inode = NotSet;
        am
    }

    pub fn is_folder(&self) -> bool {
        self.kind == EntryKind::Folder
    }
}
