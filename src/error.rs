//! Unified error surface for the manager and its subsystems.
//!
//! The kernel bridge only ever sees POSIX errnos; everything internal goes
//! through [`FsError`] so the diagnostic log keeps the full context chain
//! while the caller gets a single errno via [`FsError::errno`].

use rand::RngCore;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("entry not found")]
    NotFound,

    #[error("entry already exists: {name} in parent {parent}")]
    Conflict { parent: i64, name: String },

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("invalid file handle: {0}")]
    BadHandle(u64),

    #[error("not a directory: {0}")]
    NotADirectory(i64),

    #[error("is a directory: {0}")]
    IsADirectory(i64),

    #[error("directory not empty: {0}")]
    NotEmpty(i64),

    #[error("could not acquire remote lock on {0}")]
    Locked(String),

    #[error("catalog failed schema check")]
    Corrupt,

    #[error("remote catalog changed during commit")]
    Diverged,

    #[error("no backend has enough free space")]
    NoSpace,

    #[error("operation canceled")]
    Canceled,

    #[error("catalog error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl FsError {
    /// POSIX errno reported to the kernel bridge.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::Conflict { .. } => libc::EEXIST,
            FsError::Invalid(_) => libc::EINVAL,
            FsError::BadHandle(_) => libc::EBADF,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::NoSpace => libc::ENOSPC,
            FsError::Canceled => libc::EINTR,
            FsError::Locked(_)
            | FsError::Corrupt
            | FsError::Diverged
            | FsError::Database(_)
            | FsError::Io(_)
            | FsError::Other(_) => libc::EIO,
        }
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, FsError::Io(_) | FsError::Locked(_))
    }
}

/// Retry `op` up to `max_attempts` times with exponential backoff and jitter.
///
/// Only transient errors are retried; everything else returns immediately.
pub(crate) async fn retry<F, Fut, T>(max_attempts: u32, mut op: F) -> Result<T, FsError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FsError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                let jitter = rand::rng().next_u64() % 20;
                tokio::time::sleep(Duration::from_millis(20u64 * (1 << attempt) + jitter)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn errno_mapping_matches_posix() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(
            FsError::Conflict {
                parent: 1,
                name: "x".into()
            }
            .errno(),
            libc::EEXIST
        );
        assert_eq!(FsError::Locked("a".into()).errno(), libc::EIO);
        assert_eq!(FsError::NoSpace.errno(), libc::ENOSPC);
        assert_eq!(FsError::NotEmpty(3).errno(), libc::ENOTEMPTY);
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_errors() {
        let failures = AtomicU32::new(3);
        let flaky = || async {
            if failures.load(Ordering::Relaxed) > 0 {
                failures.fetch_sub(1, Ordering::Relaxed);
                Err(FsError::Io(std::io::Error::other("flaky")))
            } else {
                Ok(42)
            }
        };

        assert_eq!(retry(5, flaky).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn retry_gives_up_on_permanent_errors() {
        let calls = AtomicU32::new(0);
        let op = || async {
            calls.fetch_add(1, Ordering::Relaxed);
            Err::<(), _>(FsError::NotFound)
        };

        assert!(matches!(retry(5, op).await, Err(FsError::NotFound)));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
