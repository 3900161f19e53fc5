//! List extraction from the upstream tarball.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Component, Path};

use exn::ResultExt;
use geosite_compress::Compression;
use tracing::instrument;

use crate::error::{ErrorKind, Result};
use crate::keys::is_valid_name;

/// Extract every `*/data/{name}` file, keyed by lowercase name, on the
/// blocking pool.
pub async fn extract_sources(archive: Vec<u8>) -> Result<BTreeMap<String, String>> {
    tokio::task::spawn_blocking(move || read_sources(&archive))
        .await
        .or_raise(|| ErrorKind::Archive("extraction task failed".to_string()))?
}

/// Read list sources from a (optionally gzip-compressed) tar archive.
///
/// Entries outside a `data` directory, directories, and files whose name is
/// not a valid list name are ignored.
#[instrument(skip(archive), fields(bytes = archive.len(), lists))]
pub fn read_sources(archive: &[u8]) -> Result<BTreeMap<String, String>> {
    let unreadable = || ErrorKind::Archive("unreadable tar archive".to_string());
    let reader = Compression::from_magic_bytes(archive).wrap_reader(archive);
    let mut tarball = tar::Archive::new(reader);
    let mut sources = BTreeMap::new();
    for entry in tarball.entries().or_raise(unreadable)? {
        let mut entry = entry.or_raise(unreadable)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let Some(name) = list_name(&entry.path().or_raise(unreadable)?) else {
            continue;
        };
        let mut text = String::new();
        entry
            .read_to_string(&mut text)
            .or_raise(|| ErrorKind::Archive(format!("list {name} is not valid UTF-8")))?;
        sources.insert(name, text);
    }
    tracing::Span::current().record("lists", sources.len());
    Ok(sources)
}

/// `repo-master/data/google` is the list `google`.
fn list_name(path: &Path) -> Option<String> {
    let mut components = path.components().rev();
    let Some(Component::Normal(file)) = components.next() else {
        return None;
    };
    let Some(Component::Normal(parent)) = components.next() else {
        return None;
    };
    if parent != "data" || components.next().is_none() {
        return None;
    }
    let name = file.to_str()?.to_lowercase();
    is_valid_name(&name).then_some(name)
}
