//! Service Error Types
//!
//! Kinds are `Clone` so a failed shared build can hand the same error to
//! every caller waiting on it.

use derive_more::{Display, Error};

/// A service error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for service operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// List name or filter has characters outside `[a-z0-9!-]`. Fix the request.
    #[display("invalid name: {_0:?}")]
    InvalidName(#[error(not(source))] String),
    /// Nothing has been published yet. Wait for the first refresh.
    #[display("geosite data not ready")]
    NotReady,
    /// The published snapshot has no such list.
    #[display("list not found: {_0}")]
    ListNotFound(#[error(not(source))] String),
    /// The upstream archive could not be checked or downloaded.
    #[display("upstream error: {_0}")]
    Upstream(#[error(not(source))] String),
    /// The upstream archive could not be read.
    #[display("archive error: {_0}")]
    Archive(#[error(not(source))] String),
    /// The upstream archive contained no list files.
    #[display("no geosite data files found in upstream archive")]
    EmptyArchive,
    /// The upstream lists failed to parse or resolve; nothing was published.
    #[display("snapshot validation failed: {_0}")]
    Validation(#[error(not(source))] String),
    /// Durable storage failed.
    #[display("storage error: {_0}")]
    Storage(#[error(not(source))] String),
    /// A stored blob could not be decoded.
    #[display("invalid stored data: {_0}")]
    InvalidData(#[error(not(source))] String),
    /// An artifact could not be built.
    #[display("build failed: {_0}")]
    Build(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotReady | Self::Upstream(_) | Self::Storage(_) | Self::Build(_))
    }

    /// Returns `true` when the request itself was at fault.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidName(_) | Self::ListNotFound(_))
    }
}
