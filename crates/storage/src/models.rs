//! Storage models.

use std::path::PathBuf;
use time::OffsetDateTime;

/// Metadata for one stored object, as returned by listing and `stat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Relative path from storage root
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Last modified timestamp
    pub modified: OffsetDateTime,
}
impl FileInfo {
    pub fn new(path: impl Into<PathBuf>, size: u64, modified: impl Into<OffsetDateTime>) -> Self {
        Self { path: path.into(), size, modified: modified.into() }
    }
}
