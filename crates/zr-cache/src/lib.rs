#![deny(clippy::all)]

//! Local content-addressed cache of task results.
//!
//! Entries are keyed by a task fingerprint and stored as small JSON
//! marker files under the cache directory. A marker is only ever written
//! for a clean success, so the presence of one is the skip decision.

mod fs;

pub use fs::FsCache;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid cache metadata file")]
    InvalidMetadata(#[source] serde_json::Error),
    #[error("failed to write cache metadata file")]
    MetadataWriteFailure(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    Local,
}

/// Returned on a cache hit: where the entry came from and how long the
/// original run took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHitMetadata {
    pub source: CacheSource,
    pub time_saved: u64,
}

#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct CacheMetadata {
    pub hash: String,
    pub exit_code: i32,
    pub duration: u64,
}
