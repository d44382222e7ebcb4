//! In-memory drive for tests and scenario simulation.

use crate::drive::{Drive, ObjectMeta};
use crate::error::FsError;
use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

struct StoredObject {
    data: Vec<u8>,
    modified: SystemTime,
}

/// A drive whose objects live on the heap. Capacity is adjustable at
/// runtime so placement decisions can be simulated.
pub struct MemoryDrive {
    name: String,
    capacity: AtomicU64,
    objects: DashMap<String, StoredObject>,
}

impl MemoryDrive {
    pub fn new(name: String, capacity: u64) -> Self {
        Self {
            name,
            capacity: AtomicU64::new(capacity),
            objects: DashMap::new(),
        }
    }

    pub fn set_capacity(&self, capacity: u64) {
        self.capacity.store(capacity, Ordering::Relaxed);
    }

    fn used_bytes(&self) -> u64 {
        self.objects.iter().map(|o| o.data.len() as u64).sum()
    }
}

#[async_trait]
impl Drive for MemoryDrive {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, FsError> {
        self.objects
            .get(name)
            .map(|o| o.data.clone())
            .ok_or(FsError::NotFound)
    }

    async fn put(&self, name: &str, data: &[u8]) -> Result<(), FsError> {
        self.objects.insert(
            name.to_string(),
            StoredObject {
                data: data.to_vec(),
                modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), FsError> {
        self.objects
            .remove(name)
            .map(|_| ())
            .ok_or(FsError::NotFound)
    }

    async fn rename(&self, old: &str, new: &str) -> Result<(), FsError> {
        let (_, obj) = self.objects.remove(old).ok_or(FsError::NotFound)?;
        self.objects.insert(new.to_string(), obj);
        Ok(())
    }

    async fn get_metadata(&self, name: &str) -> Result<ObjectMeta, FsError> {
        let obj = self.objects.get(name).ok_or(FsError::NotFound)?;
        Ok(ObjectMeta {
            size: obj.data.len() as u64,
            hash: self.compute_hash(&obj.data),
            modified: Some(obj.modified),
        })
    }

    async fn free_space(&self) -> Result<u64, FsError> {
        Ok(self
            .capacity
            .load(Ordering::Relaxed)
            .saturating_sub(self.used_bytes()))
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

    #[tokio::test]
    async fn capacity_is_adjustable() {
        let drive = MemoryDrive::new("mem".to_string(), 1000);
        drive.put("a", &[0u8; 300]).await.unwrap();
        assert_eq!(drive.free_space().await.unwrap(), 700);

        drive.set_capacity(400);
        assert_eq!(drive.free_space().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn hash_matches_metadata() {
        let drive = MemoryDrive::new("mem".to_string(), 1000);
        drive.put("a", b"bytes").await.unwrap();
        let meta = drive.get_metadata("a").await.unwrap();
        assert_eq!(meta.hash, drive.compute_hash(b"bytes"));
    }
}
