//! Edge service for geosite rule sets.
//!
//! [`GeositeService::refresh`] mirrors the upstream domain-list archive into
//! content-addressed snapshots behind a single pointer;
//! [`GeositeService::request`] serves rendered rule sets for the published
//! snapshot from any [`StorageBackend`](geosite_storage::StorageBackend).

mod archive;
pub mod error;
mod flight;
pub mod keys;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod models;
mod service;
pub mod upstream;

pub use crate::archive::read_sources;
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::models::{Index, IndexEntry, IndexView, LatestPointer, RefreshOutcome, RefreshReason, Served};
pub use crate::service::{Clock, GeositeService, ServiceOptions, split_name_filter, system_clock};
pub use crate::upstream::{HttpUpstream, Upstream};
