//! Offline build: every list of a local data directory rendered under every
//! mode, with resolved entries, stats and an index.
//!
//! ```text
//! {out}/meta.json
//! {out}/index/geosite.json
//! {out}/rules/{mode}/{list}.txt
//! {out}/resolved/{list}.json
//! {out}/stats/global.json
//! {out}/stats/lists/{list}.json
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use exn::ResultExt;
use geosite_core::stats::{GlobalStats, ListStats};
use geosite_core::{DomainRule, EmitOptions, Emitted, Mode, emit, parse_lists, resolve_all};
use geosite_service::keys;
use geosite_service::{Index, IndexEntry};
use geosite_storage::StorageBackend;
use geosite_storage::backend::LocalBackend;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::instrument;

use crate::error::{ErrorKind, Result};

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub data_dir: PathBuf,
    pub out_dir: PathBuf,
    /// Lists to build; all of them when empty.
    pub lists: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Meta {
    generated_at: String,
    default_mode: Mode,
    lists: usize,
    modes: [Mode; 3],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSummary {
    pub lists: usize,
    pub out_dir: PathBuf,
}

fn open(name: &str, dir: &Path) -> Result<LocalBackend> {
    let root = std::path::absolute(dir).or_raise(|| ErrorKind::Build(format!("invalid path: {}", dir.display())))?;
    LocalBackend::new(name, &root).or_raise(|| ErrorKind::Build(format!("cannot use directory {}", root.display())))
}

/// Every top-level file of `data` whose name is a valid list name, keyed by
/// that name.
pub async fn load_sources(data: &dyn StorageBackend) -> Result<BTreeMap<String, String>> {
    let files = data.list(None).await.or_raise(|| ErrorKind::Build("failed to list data directory".to_string()))?;
    let mut sources = BTreeMap::new();
    for file in files {
        let Some(name) = file.path.to_str().filter(|name| keys::is_valid_name(name)) else {
            continue;
        };
        let bytes = data.read(&file.path).await.or_raise(|| ErrorKind::Build(format!("failed to read {name}")))?;
        let text = String::from_utf8(bytes).or_raise(|| ErrorKind::Build(format!("list {name} is not valid UTF-8")))?;
        sources.insert(name.to_string(), text);
    }
    Ok(sources)
}

async fn write_text(out: &LocalBackend, key: &str, text: &str) -> Result<()> {
    out.write(Path::new(key), text.as_bytes()).await.or_raise(|| ErrorKind::Build(format!("failed to write {key}")))
}

async fn write_json<T: Serialize + ?Sized>(out: &LocalBackend, key: &str, value: &T) -> Result<()> {
    let mut json =
        serde_json::to_string_pretty(value).or_raise(|| ErrorKind::Build(format!("failed to encode {key}")))?;
    json.push('\n');
    write_text(out, key, &json).await
}

#[instrument(skip(options), fields(data = %options.data_dir.display(), out = %options.out_dir.display(), lists))]
pub async fn run(options: &BuildOptions, generated_at: OffsetDateTime) -> Result<BuildSummary> {
    if !options.data_dir.is_dir() {
        exn::bail!(ErrorKind::Build(format!("data directory not found: {}", options.data_dir.display())));
    }
    let sources = load_sources(&open("data", &options.data_dir)?).await?;
    let parsed = parse_lists(&sources).or_raise(|| ErrorKind::Build("failed to parse lists".to_string()))?;
    let resolved = resolve_all(&parsed).or_raise(|| ErrorKind::Build("failed to resolve lists".to_string()))?;

    let names: Vec<String> = match options.lists.is_empty() {
        true => resolved.keys().cloned().collect(),
        false => options
            .lists
            .iter()
            .map(|name| name.trim().to_uppercase())
            .filter(|name| !name.is_empty())
            .collect(),
    };
    if let Some(missing) = names.iter().find(|name| !resolved.contains_key(*name)) {
        exn::bail!(ErrorKind::UnknownList(missing.clone()));
    }

    let out = open("out", &options.out_dir)?;
    let mut stats = Vec::with_capacity(names.len());
    let mut index = Index::new();
    for name in &names {
        let list = &resolved[name];
        let lower = name.to_lowercase();
        let mut emitted: Vec<(Mode, Emitted)> = Vec::with_capacity(Mode::ALL.len());
        for mode in Mode::ALL {
            let rendered = emit(list, &EmitOptions::with_mode(mode))
                .or_raise(|| ErrorKind::Build(format!("failed to emit {name} under {mode}")))?;
            write_text(&out, &keys::rules(mode, &lower), &format!("{}\n", rendered.text)).await?;
            emitted.push((mode, rendered));
        }
        let entries: Vec<&DomainRule> = list.entries.iter().map(|entry| &**entry).collect();
        write_json(&out, &format!("resolved/{lower}.json"), &entries).await?;

        let source = parsed.get(name).map_or(&[][..], Vec::as_slice);
        let list_stats = ListStats::new(source, list, emitted.iter().map(|(mode, emitted)| (*mode, emitted)));
        write_json(&out, &format!("stats/lists/{lower}.json"), &list_stats).await?;

        let source_file = sources.contains_key(&lower).then(|| lower.clone());
        let filters = list_stats.filters.attrs.keys().cloned().collect();
        index.insert(lower.clone(), IndexEntry::new(&lower, source_file, filters));
        stats.push(list_stats);
    }

    write_json(&out, "stats/global.json", &GlobalStats::aggregate(&stats)).await?;
    write_json(&out, "index/geosite.json", &index).await?;
    let meta = Meta {
        generated_at: generated_at.format(&Rfc3339).or_raise(|| ErrorKind::Build("invalid timestamp".to_string()))?,
        default_mode: Mode::Balanced,
        lists: stats.len(),
        modes: Mode::ALL,
    };
    write_json(&out, "meta.json", &meta).await?;

    tracing::Span::current().record("lists", stats.len());
    Ok(BuildSummary { lists: stats.len(), out_dir: out.root().to_path_buf() })
}
