//! Binary Error Types

use derive_more::{Display, Error};

/// A command error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for command operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Configuration could not be loaded or is invalid. Fix the config.
    #[display("configuration error")]
    Config,
    /// The configured storage backend could not be set up.
    #[display("storage setup failed: {_0}")]
    Storage(#[error(not(source))] String),
    /// The refresh or serving machinery failed.
    #[display("service error")]
    Service,
    /// The HTTP listener could not be bound or stopped unexpectedly.
    #[display("server error: {_0}")]
    Server(#[error(not(source))] String),
    /// The offline build failed to read, resolve, render or write lists.
    #[display("build failed: {_0}")]
    Build(#[error(not(source))] String),
    /// A list requested for the offline build does not exist.
    #[display("list not found: {_0}")]
    UnknownList(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Service | Self::Server(_))
    }
}
