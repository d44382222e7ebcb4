//! Local body cache.
//!
//! File bodies are materialized under the cache directory on first open and
//! serve all subsequent reads and writes; the dirty tracker and flusher in
//! the manager decide when a body travels back to its drive.

pub mod disk;

pub use disk::DiskCache;
