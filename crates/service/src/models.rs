//! Durable records: the published pointer, snapshots and the list index.

use std::collections::BTreeMap;

use geosite_core::Mode;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::keys;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Where the published snapshot came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamRef {
    pub url: String,
    pub etag: String,
}

/// Where the published snapshot lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRef {
    pub source_key: String,
    pub index_key: String,
    pub list_count: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
}

/// The single mutable record, stored at [`keys::LATEST`].
///
/// It only ever advances to a different etag; `previous_etag` remembers the
/// one it replaced so its artifacts can be served stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestPointer {
    pub upstream: UpstreamRef,
    pub snapshot: SnapshotRef,
    pub previous_etag: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
}
impl LatestPointer {
    pub fn etag(&self) -> &str {
        &self.upstream.etag
    }
}

/// Raw list sources for one upstream version, keyed by lowercase file name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: u32,
    pub etag: String,
    pub upstream_url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub lists: BTreeMap<String, String>,
}
impl Snapshot {
    pub fn new(
        etag: impl Into<String>,
        upstream_url: impl Into<String>,
        generated_at: OffsetDateTime,
        lists: BTreeMap<String, String>,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            etag: etag.into(),
            upstream_url: upstream_url.into(),
            generated_at,
            lists,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    /// Attributes known to occur in the resolved list. Starts empty for
    /// snapshots and fills in as lists are built.
    pub filters: Vec<String>,
    pub modes: BTreeMap<Mode, String>,
}
impl IndexEntry {
    pub fn new(name: &str, source_file: Option<String>, filters: Vec<String>) -> Self {
        let name = name.to_lowercase();
        Self {
            display_name: name.to_uppercase(),
            source_file,
            filters,
            modes: Mode::ALL.into_iter().map(|mode| (mode, keys::rules(mode, &name))).collect(),
        }
    }
}

/// Every list of a snapshot, keyed by lowercase name.
pub type Index = BTreeMap<String, IndexEntry>;

/// Index every source file of a snapshot with no filters yet.
pub fn index_from_sources<'a>(names: impl IntoIterator<Item = &'a String>) -> Index {
    names
        .into_iter()
        .map(|name| (name.to_lowercase(), IndexEntry::new(name, Some(name.to_lowercase()), Vec::new())))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshReason {
    EtagUnchanged,
    EtagUpdated,
}

/// What one refresh run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshOutcome {
    pub updated: bool,
    pub reason: RefreshReason,
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub etag: String,
    pub list_count: usize,
}
impl RefreshOutcome {
    pub fn unchanged(checked_at: OffsetDateTime, etag: impl Into<String>, list_count: usize) -> Self {
        Self { updated: false, reason: RefreshReason::EtagUnchanged, checked_at, etag: etag.into(), list_count }
    }

    pub fn updated(checked_at: OffsetDateTime, etag: impl Into<String>, list_count: usize) -> Self {
        Self { updated: true, reason: RefreshReason::EtagUpdated, checked_at, etag: etag.into(), list_count }
    }
}

/// One served rule set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Served {
    pub body: String,
    /// Etag of the snapshot the body was built from.
    pub etag: String,
    pub mode: Mode,
    /// Lowercase list name.
    pub list: String,
    pub filter: Option<String>,
    /// Built from the previous snapshot while the current one builds.
    pub stale: bool,
}

/// The published index together with the pointer it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexView {
    pub pointer: LatestPointer,
    pub index: Index,
}
