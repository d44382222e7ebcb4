//! Background flusher: a periodic task pushing dirty bodies and the
//! catalog to their drives.

use crate::manager::Manager;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::info;

/// Handle to the spawned flusher task.
pub struct Flusher {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Flusher {
    /// Spawn the flusher loop for `manager`.
    pub fn spawn(manager: Arc<Manager>) -> Self {
        let (shutdown, mut rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut tick = interval(manager.flush_interval());
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = tick.tick() => manager.flush_due().await,
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }

            // final drain so no dirty data is stranded
            manager.flush_all().await;
            info!("flusher stopped");
        });

        Self { shutdown, task }
    }

    /// Signal shutdown and wait for the final drain.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKey;
    use crate::drive::{Drive, MemoryDrive};
    use crate::manager::MountOptions;
    use std::time::Duration;

    #[tokio::test]
    async fn flusher_uploads_dirty_bodies() {
        let drive = Arc::new(MemoryDrive::new("mem".to_string(), 1 << 20));
        let drives: Vec<Arc<dyn Drive>> = vec![drive.clone()];

        let dir = tempfile::tempdir().unwrap();
        let mut options = MountOptions::new(dir.path().join("cache"));
        options.flush_interval = Duration::from_millis(50);
        options.lock_timeout = Duration::from_secs(1);
        options.lock_poll = Duration::from_millis(10);

        let manager = Manager::new(drives, MasterKey::from_bytes([1u8; 32]), options)
            .await
            .unwrap();
        let flusher = Flusher::spawn(manager.clone());

        let entry = manager.create(1, "note.txt", 0o644).await.unwrap();
        let fh = manager.open(entry.inode).await.unwrap();
        manager.write(fh, 0, b"dirty bytes").await.unwrap();
        manager.release(fh).await.unwrap();

        // the periodic tick picks the inode up without an explicit flush
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while manager.dirty_count().await > 0 {
            assert!(tokio::time::Instant::now() < deadline, "flush never ran");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let flushed = manager.get_attrs(entry.inode).await.unwrap();
        assert_eq!(flushed.size, 11);
        assert!(!flushed.hash.is_empty());

        flusher.stop().await;
    }

    #[tokio::test]
    async fn stop_drains_remaining_dirty_state() {
        let drive = Arc::new(MemoryDrive::new("mem".to_string(), 1 << 20));
        let drives: Vec<Arc<dyn Drive>> = vec![drive.clone()];

        let dir = tempfile::tempdir().unwrap();
        let mut options = MountOptions::new(dir.path().join("cache"));
        // effectively never ticks on its own
        options.flush_interval = Duration::from_secs(3600);
        options.lock_timeout = Duration::from_secs(1);
        options.lock_poll = Duration::from_millis(10);

        let manager = Manager::new(drives, MasterKey::from_bytes([1u8; 32]), options)
            .await
            .unwrap();
        let flusher = Flusher::spawn(manager.clone());

        let entry = manager.create(1, "drain.txt", 0o644).await.unwrap();
        let fh = manager.open(entry.inode).await.unwrap();
        manager.write(fh, 0, b"last words").await.unwrap();
        manager.release(fh).await.unwrap();

        flusher.stop().await;
        assert_eq!(manager.dirty_count().await, 0);
    }
}
