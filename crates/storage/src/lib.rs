//! Durable storage for snapshots, indexes and rendered artifacts.
//!
//! Keys are relative, `/`-separated paths such as `state/latest.json`. Every
//! backend validates keys with [`validate_path`] before touching storage.

pub mod backend;
pub mod error;
mod models;
mod path;

pub use crate::backend::StorageBackend;
pub use crate::models::FileInfo;
pub use crate::path::validate as validate_path;
use std::sync::Arc;

pub type BackendHandle = Arc<dyn StorageBackend + Send + Sync>;
