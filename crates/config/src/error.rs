//! Configuration Error Types

use derive_more::{Display, Error};

/// A configuration error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for configuration loading.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// Neither is retryable: the configuration has to be fixed.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A source could not be read or does not match the expected shape.
    #[display("failed to load configuration: {_0}")]
    Load(#[error(not(source))] String),
    /// Values loaded but are unusable.
    #[display("invalid configuration: {_0}")]
    Invalid(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_display() {
        assert_eq!(
            ErrorKind::Load("missing file".to_string()).to_string(),
            "failed to load configuration: missing file"
        );
        assert_eq!(
            ErrorKind::Invalid("cache.snapshots must be at least 1".to_string()).to_string(),
            "invalid configuration: cache.snapshots must be at least 1"
        );
        assert!(!ErrorKind::Load(String::new()).is_retryable());
    }
}
