//! Durable key layout.
//!
//! ```text
//! state/latest.json
//! snapshots/{etag}/sources.json.gz
//! snapshots/{etag}/index/geosite.json
//! artifacts/{etag}/{mode}/{name}[@filter].txt
//! ```
//!
//! Everything except the pointer is content-addressed by etag and never
//! rewritten with different content.

use geosite_core::Mode;

pub const LATEST: &str = "state/latest.json";

pub fn snapshot_sources(etag: &str) -> String {
    format!("snapshots/{etag}/sources.json.gz")
}

pub fn snapshot_index(etag: &str) -> String {
    format!("snapshots/{etag}/index/geosite.json")
}

pub fn artifact_name(name: &str, filter: Option<&str>) -> String {
    match filter {
        Some(filter) => format!("{name}@{filter}"),
        None => name.to_string(),
    }
}

pub fn artifact(etag: &str, mode: Mode, name: &str, filter: Option<&str>) -> String {
    format!("artifacts/{etag}/{mode}/{}.txt", artifact_name(name, filter))
}

/// Rule file path for one list under one mode, as listed in the index.
pub fn rules(mode: Mode, name: &str) -> String {
    format!("rules/{mode}/{name}.txt")
}

/// Strip the weak prefix and surrounding quotes from a raw `ETag` header.
///
/// ```
/// use geosite_service::keys::normalize_etag;
///
/// assert_eq!(normalize_etag("W/\"abc123\"").as_deref(), Some("abc123"));
/// assert_eq!(normalize_etag("\"\""), None);
/// ```
pub fn normalize_etag(raw: &str) -> Option<String> {
    let etag = raw.strip_prefix("W/").unwrap_or(raw);
    let etag = etag.strip_prefix('"').unwrap_or(etag);
    let etag = etag.strip_suffix('"').unwrap_or(etag).trim();
    (!etag.is_empty()).then(|| etag.to_string())
}

/// Etags become key components; anything that could change the key layout
/// is replaced by a digest of the etag.
pub fn key_safe_etag(etag: String) -> String {
    let safe = etag.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        && !etag.starts_with('.');
    match safe {
        true => etag,
        false => blake3::hash(etag.as_bytes()).to_hex().to_string(),
    }
}

/// Whether `input` is a valid lowercase list name or filter.
pub fn is_valid_name(input: &str) -> bool {
    !input.is_empty() && input.bytes().all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'!' | b'-'))
}
