//! Pipeline Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Parse, resolve and emit failures are
//! all fail-fast: a list is never half-parsed and a resolution run is never
//! half-resolved.

use derive_more::{Display, Error};

/// A pipeline error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A line of list source is malformed. Fix the source; the whole list is
    /// rejected.
    #[display("error in {list} at line {line}: {reason}")]
    Parse {
        /// Canonical (uppercase) list name.
        list: String,
        /// 1-based line number.
        line: usize,
        /// What was wrong with the line.
        reason: String,
    },
    /// A list name (file name, include target or affiliation) has characters
    /// outside `[A-Z0-9!-]`.
    #[display("invalid list name: {_0:?}")]
    InvalidListName(#[error(not(source))] String),
    /// The requested list does not exist after resolution.
    #[display("list does not exist: {_0}")]
    UnknownList(#[error(not(source))] String),
    /// An include directive points at a list nobody defines.
    #[display("list {list} includes a non-existent list: {target}")]
    MissingInclude {
        /// The including list.
        list: String,
        /// The missing include target.
        target: String,
    },
    /// The include graph contains a cycle; the full path is reported with the
    /// repeated list at both ends.
    #[display("circular inclusion detected: {}", _0.join(" -> "))]
    CircularInclusion(#[error(not(source))] Vec<String>),
    /// A regexp rule could not be converted and unsupported patterns were
    /// configured to fail the emit.
    #[display("unsupported regex in {list} at line {line}: {pattern} ({reason})")]
    UnsupportedRegex {
        /// List the rule was emitted for.
        list: String,
        /// Line of the rule in its source list.
        line: usize,
        /// The offending pattern.
        pattern: String,
        /// Why conversion failed.
        reason: String,
    },
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        // Everything here is a pure function of the input text.
        false
    }

    /// Returns `true` for malformed-source errors, `false` for errors about
    /// the include graph or emission.
    pub fn is_parse_error(&self) -> bool {
        matches!(self, Self::Parse { .. } | Self::InvalidListName(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_display() {
        let parse = ErrorKind::Parse {
            list: "GOOGLE".to_string(),
            line: 3,
            reason: "invalid type: \"domian\"".to_string(),
        };
        assert_eq!(parse.to_string(), "error in GOOGLE at line 3: invalid type: \"domian\"");
        let cycle = ErrorKind::CircularInclusion(vec!["A".to_string(), "B".to_string(), "A".to_string()]);
        assert_eq!(cycle.to_string(), "circular inclusion detected: A -> B -> A");
    }

    #[test]
    fn error_kind_classification() {
        assert!(ErrorKind::InvalidListName("a b".to_string()).is_parse_error());
        assert!(!ErrorKind::UnknownList("NOPE".to_string()).is_parse_error());
        assert!(!ErrorKind::UnknownList("NOPE".to_string()).is_retryable());
    }
}
