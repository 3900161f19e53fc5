//! Storage key validation.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Validates and normalizes a storage key.
///
/// Keys never escape the storage root (no `..` traversal past the start),
/// never contain null bytes and are never empty once `.` and duplicate
/// separators are removed.
///
/// > **Note:** This does **not** normalize backslashes or non-UTF8 bytes.
///
/// # Returns
/// The normalized key, or [`InvalidPath`](crate::error::ErrorKind::InvalidPath).
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use geosite_storage::validate_path;
/// // Valid keys
/// assert!(validate_path("state/latest.json").is_ok());
/// assert!(validate_path("artifacts/abc/balanced/google@cn.txt").is_ok());
/// assert!(validate_path("snapshots/../state/latest.json").is_ok()); // (never leaves root)
/// // Invalid keys
/// assert!(validate_path("../etc/passwd").is_err());
/// assert!(validate_path("a/../../b").is_err());
/// assert!(validate_path("a\0b").is_err());
/// // Keys get resolved
/// assert_eq!(
///     validate_path("snapshots//abc/./index/../sources.json.gz/").unwrap(),
///     Path::new("snapshots/abc/sources.json.gz")
/// );
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let invalid = || ErrorKind::InvalidPath(path.as_ref().to_path_buf());
    let mut components = Vec::new();
    for component in path.as_ref().components() {
        match component {
            Component::Normal(s) => {
                // Null bytes pass through Path::components() on Unix but
                // truncate in C-based syscalls.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(invalid());
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(invalid()),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(invalid());
                }
            },
        }
    }
    if components.is_empty() {
        exn::bail!(invalid());
    }
    Ok(components.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_keys() {
        assert_eq!(validate("state/latest.json").unwrap(), Path::new("state/latest.json"));
        assert_eq!(
            validate("snapshots/abc123/index/geosite.json").unwrap(),
            Path::new("snapshots/abc123/index/geosite.json")
        );
        assert_eq!(validate("meta.json").unwrap(), Path::new("meta.json"));
    }

    #[test]
    fn test_normalization() {
        assert_eq!(validate("rules//strict//google.txt").unwrap(), Path::new("rules/strict/google.txt"));
        assert_eq!(validate("rules/./strict/./google.txt").unwrap(), Path::new("rules/strict/google.txt"));
        assert_eq!(validate("/state/latest.json").unwrap(), Path::new("state/latest.json"));
    }

    #[test]
    fn test_traversal_attempts() {
        assert!(validate("../etc/passwd").is_err());
        assert!(validate("a/../../b").is_err());
        assert!(validate("..").is_err());
        assert!(validate("../..").is_err());
        // Stays within the root
        assert_eq!(validate("a/b/..").unwrap(), Path::new("a"));
    }

    #[test]
    fn test_null_bytes() {
        assert!(validate("a\0b").is_err());
        assert!(validate("\0").is_err());
    }

    #[test]
    fn test_empty_keys() {
        for key in ["", ".", "./", "./.", "//"] {
            let err = validate(key).unwrap_err();
            assert!(matches!(&*err, ErrorKind::InvalidPath(_)), "{key:?}");
        }
    }

    #[test]
    fn test_trailing_slashes() {
        assert_eq!(validate("resolved/").unwrap(), Path::new("resolved"));
        assert_eq!(validate("stats/lists///").unwrap(), Path::new("stats/lists"));
    }
}
