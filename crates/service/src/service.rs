//! The freshness and artifact cache manager.
//!
//! Refreshes mirror the upstream archive into content-addressed snapshots and
//! advance the published pointer. Requests serve rendered artifacts for the
//! published snapshot, building each `(etag, mode, list[@filter])` at most
//! once per process and serving the previous snapshot's artifact while a
//! new one builds.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use exn::{OptionExt, ResultExt};
use geosite_compress::Compression;
use geosite_core::{EmitOptions, Mode, ResolvedList, build_resolved_lists, emit};
use geosite_storage::BackendHandle;
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tracing::instrument;

use crate::archive::extract_sources;
use crate::error::{Error, ErrorKind, Result};
use crate::flight::{BoundedCache, BuildLocks, SharedOutcome};
use crate::keys;
use crate::models::{
    Index, IndexView, LatestPointer, RefreshOutcome, Served, Snapshot, SnapshotRef, UpstreamRef, index_from_sources,
};
use crate::upstream::Upstream;

/// Source of "now" for pointer and snapshot timestamps.
pub type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(OffsetDateTime::now_utc)
}

/// Capacities of the in-memory caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceOptions {
    /// Decompressed snapshots kept in memory.
    pub snapshot_cache: usize,
    /// Fully resolved list maps kept in memory.
    pub resolved_cache: usize,
}
impl Default for ServiceOptions {
    fn default() -> Self {
        Self { snapshot_cache: 2, resolved_cache: 2 }
    }
}

type ResolvedLists = Arc<BTreeMap<String, ResolvedList>>;

/// Result of one artifact build, shared between every caller of its key.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Built {
    list_found: bool,
    output: String,
    /// Attributes occurring in the list; empty when the artifact was
    /// already stored.
    filters: Vec<String>,
}

struct Inner {
    storage: BackendHandle,
    upstream: Arc<dyn Upstream>,
    clock: Clock,
    snapshots: BoundedCache<Arc<Snapshot>>,
    resolved: BoundedCache<ResolvedLists>,
    builds: BuildLocks<Built>,
    build_count: AtomicU64,
}

/// Cheap to clone; clones share caches and in-flight builds.
#[derive(Clone)]
pub struct GeositeService {
    inner: Arc<Inner>,
}

impl GeositeService {
    pub fn new(storage: BackendHandle, upstream: Arc<dyn Upstream>, options: ServiceOptions) -> Self {
        Self::with_clock(storage, upstream, options, system_clock())
    }

    pub fn with_clock(
        storage: BackendHandle,
        upstream: Arc<dyn Upstream>,
        options: ServiceOptions,
        clock: Clock,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                upstream,
                clock,
                snapshots: BoundedCache::new(options.snapshot_cache),
                resolved: BoundedCache::new(options.resolved_cache),
                builds: BuildLocks::default(),
                build_count: AtomicU64::new(0),
            }),
        }
    }

    /// Number of artifacts computed (not merely read back) by this instance.
    pub fn builds(&self) -> u64 {
        self.inner.build_count.load(Ordering::SeqCst)
    }

    /// Number of artifact builds currently running.
    pub fn builds_in_flight(&self) -> usize {
        self.inner.builds.len()
    }

    fn now(&self) -> OffsetDateTime {
        (self.inner.clock)()
    }

    /// Check upstream and publish a new snapshot if it changed.
    ///
    /// Any failure leaves the published pointer as it was.
    #[instrument(skip(self), fields(upstream = %self.inner.upstream.url(), etag, updated))]
    pub async fn refresh(&self) -> Result<RefreshOutcome> {
        let upstream = &self.inner.upstream;
        let checked_at = self.now();
        let current = self.pointer().await?;
        let current_etag = current.as_ref().map(|pointer| pointer.etag().to_string());

        let head_etag = upstream.head().await?.as_deref().and_then(keys::normalize_etag).map(keys::key_safe_etag);
        if let (Some(current), Some(observed)) = (&current, &head_etag)
            && current.etag() == observed.as_str()
        {
            return self.mark_checked(current, checked_at).await;
        }

        let download = upstream.fetch().await?;
        let etag = match download.etag.as_deref().and_then(keys::normalize_etag) {
            Some(etag) => keys::key_safe_etag(etag),
            None => head_etag.unwrap_or_else(|| blake3::hash(&download.body).to_hex().to_string()),
        };
        tracing::Span::current().record("etag", etag.as_str());
        if let Some(current) = &current
            && current.etag() == etag
        {
            return self.mark_checked(current, checked_at).await;
        }

        let sources = extract_sources(download.body).await?;
        if sources.is_empty() {
            exn::bail!(ErrorKind::EmptyArchive);
        }
        // Validation gate: nothing is written unless every list parses and
        // the include graph resolves.
        build_resolved_lists(&sources).or_raise(|| ErrorKind::Validation(format!("snapshot {etag} rejected")))?;

        let list_count = sources.len();
        let generated_at = self.now();
        let index = index_from_sources(sources.keys());
        let snapshot = Snapshot::new(etag.clone(), upstream.url(), generated_at, sources);
        let source_key = keys::snapshot_sources(&etag);
        let index_key = keys::snapshot_index(&etag);
        let encoded = serde_json::to_vec(&snapshot).or_raise(|| ErrorKind::InvalidData(source_key.clone()))?;
        let compressed = Compression::Gzip
            .compress(&encoded)
            .or_raise(|| ErrorKind::InvalidData(format!("failed to compress {source_key}")))?;
        self.write(&source_key, &compressed).await?;
        self.write_json(&index_key, &index).await?;

        // A concurrent refresh that already moved the pointer wins.
        if let Some(latest) = self.pointer().await?
            && Some(latest.etag()) != current_etag.as_deref()
        {
            tracing::warn!(
                ours = %etag,
                published = %latest.etag(),
                "Publication aborted; pointer advanced by a concurrent refresh"
            );
            tracing::Span::current().record("updated", false);
            return Ok(RefreshOutcome::unchanged(checked_at, latest.etag(), latest.snapshot.list_count));
        }

        let pointer = LatestPointer {
            upstream: UpstreamRef { url: upstream.url().to_string(), etag: etag.clone() },
            snapshot: SnapshotRef { source_key, index_key, list_count, generated_at },
            previous_etag: current_etag,
            checked_at,
        };
        self.write_json(keys::LATEST, &pointer).await?;
        self.inner.snapshots.clear();
        self.inner.resolved.clear();
        tracing::Span::current().record("updated", true);
        tracing::info!(%etag, lists = list_count, previous = ?pointer.previous_etag, "Published snapshot");
        Ok(RefreshOutcome::updated(checked_at, etag, list_count))
    }

    /// Record the check on the pointer, unless a concurrent refresh moved it
    /// since `observed` was read.
    async fn mark_checked(&self, observed: &LatestPointer, checked_at: OffsetDateTime) -> Result<RefreshOutcome> {
        let mut pointer = match self.pointer().await? {
            Some(latest) if latest.etag() != observed.etag() => {
                tracing::warn!(
                    observed = %observed.etag(),
                    published = %latest.etag(),
                    "Check not recorded; pointer advanced by a concurrent refresh"
                );
                tracing::Span::current().record("updated", false);
                return Ok(RefreshOutcome::unchanged(checked_at, latest.etag(), latest.snapshot.list_count));
            },
            Some(latest) => latest,
            None => observed.clone(),
        };
        pointer.checked_at = checked_at;
        self.write_json(keys::LATEST, &pointer).await?;
        tracing::Span::current().record("updated", false);
        tracing::info!(etag = %pointer.etag(), "Upstream unchanged");
        Ok(RefreshOutcome::unchanged(checked_at, pointer.etag(), pointer.snapshot.list_count))
    }

    /// The currently published pointer, if any.
    pub async fn pointer(&self) -> Result<Option<LatestPointer>> {
        self.read_json(keys::LATEST).await
    }

    /// The published index, rebuilt from the snapshot (and written back) if
    /// its blob is missing.
    #[instrument(skip(self))]
    pub async fn index(&self) -> Result<IndexView> {
        let pointer = self.pointer().await?.ok_or_raise(|| ErrorKind::NotReady)?;
        if let Some(index) = self.read_json::<Index>(&pointer.snapshot.index_key).await? {
            return Ok(IndexView { pointer, index });
        }
        let snapshot = self.snapshot(&pointer).await?;
        let index = index_from_sources(snapshot.lists.keys());
        if let Err(err) = self.write_json(&pointer.snapshot.index_key, &index).await {
            tracing::warn!(error = ?err, key = %pointer.snapshot.index_key, "Failed to restore index");
        }
        Ok(IndexView { pointer, index })
    }

    /// Serve the rule set for `name_with_filter` (`name` or `name@filter`)
    /// under `mode`.
    #[instrument(skip(self), fields(%mode, stale))]
    pub async fn request(&self, mode: Mode, name_with_filter: &str) -> Result<Served> {
        let (name, filter) = split_name_filter(name_with_filter)?;
        let pointer = self.pointer().await?.ok_or_raise(|| ErrorKind::NotReady)?;
        let etag = pointer.etag().to_string();
        let served = |body: String, etag: String, stale: bool| {
            tracing::Span::current().record("stale", stale);
            Served { body, etag, mode, list: name.clone(), filter: filter.clone(), stale }
        };

        let key = keys::artifact(&etag, mode, &name, filter.as_deref());
        if let Some(body) = self.read_text(&key).await? {
            return Ok(served(body, etag, false));
        }

        let index = self.read_json::<Index>(&pointer.snapshot.index_key).await?;
        if let Some(index) = &index
            && !index.contains_key(&name)
        {
            exn::bail!(ErrorKind::ListNotFound(name.clone()));
        }

        let build = self.start_build(&pointer, mode, &name, filter.as_deref());

        if filter.is_none()
            && let Some(previous) = pointer.previous_etag.clone()
            && let Some(body) = self.read_text(&keys::artifact(&previous, mode, &name, None)).await?
        {
            tracing::debug!(list = %name, %previous, "Serving stale artifact");
            let service = self.clone();
            let list = name.clone();
            tokio::spawn(async move {
                if let Ok(built) = build.await {
                    service.enrich_index(&pointer, &list, &built.filters).await;
                }
            });
            return Ok(served(body, previous, true));
        }

        let built = build.await?;
        if !built.list_found {
            exn::bail!(ErrorKind::ListNotFound(name.clone()));
        }
        if !built.filters.is_empty() {
            let service = self.clone();
            let (list, filters) = (name.clone(), built.filters.clone());
            tokio::spawn(async move { service.enrich_index(&pointer, &list, &filters).await });
        }
        Ok(served(built.output, etag, false))
    }

    fn start_build(
        &self,
        pointer: &LatestPointer,
        mode: Mode,
        name: &str,
        filter: Option<&str>,
    ) -> SharedOutcome<Built> {
        let lock_key = format!("{}:{mode}:{}", pointer.etag(), keys::artifact_name(name, filter));
        let service = self.clone();
        let (pointer, name, filter) = (pointer.clone(), name.to_string(), filter.map(ToString::to_string));
        self.inner.builds.run(lock_key, async move {
            service.build_artifact(&pointer, mode, &name, filter.as_deref()).await.map_err(|err| {
                tracing::error!(error = ?err, list = %name, %mode, "Artifact build failed");
                (*err).clone()
            })
        })
    }

    #[instrument(skip(self, pointer), fields(etag = %pointer.etag(), bytes))]
    async fn build_artifact(
        &self,
        pointer: &LatestPointer,
        mode: Mode,
        name: &str,
        filter: Option<&str>,
    ) -> Result<Built> {
        let key = keys::artifact(pointer.etag(), mode, name, filter);
        if let Some(output) = self.read_text(&key).await? {
            return Ok(Built { list_found: true, output, filters: Vec::new() });
        }
        self.inner.build_count.fetch_add(1, Ordering::SeqCst);

        let resolved = self.resolved(pointer).await?;
        let Some(target) = resolved.get(&name.to_uppercase()) else {
            return Ok(Built { list_found: false, output: String::new(), filters: Vec::new() });
        };
        let filters = target.filters();
        let list = match filter {
            // Unknown filters build nothing and store nothing.
            Some(filter) if !filters.iter().any(|known| known == filter) => {
                return Ok(Built { list_found: true, output: String::new(), filters });
            },
            Some(filter) => target.filtered(filter),
            None => target.clone(),
        };

        let emitted = emit(&list, &EmitOptions::with_mode(mode))
            .or_raise(|| ErrorKind::Build(format!("failed to emit {name} under {mode}")))?;
        let output = match emitted.text.is_empty() {
            true => String::new(),
            false => format!("{}\n", emitted.text),
        };
        self.write(&key, output.as_bytes()).await?;
        tracing::Span::current().record("bytes", output.len());
        Ok(Built { list_found: true, output, filters })
    }

    /// Record newly seen filters for `name` in the persisted index. Skipped
    /// when nothing changed; failures are only logged.
    async fn enrich_index(&self, pointer: &LatestPointer, name: &str, filters: &[String]) {
        if filters.is_empty() {
            return;
        }
        let mut filters = filters.to_vec();
        filters.sort();
        filters.dedup();
        let key = &pointer.snapshot.index_key;
        let mut index = match self.read_json::<Index>(key).await {
            Ok(Some(index)) => index,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(error = ?err, %key, "Failed to read index for enrichment");
                return;
            },
        };
        let Some(entry) = index.get_mut(name) else {
            return;
        };
        if entry.filters == filters {
            return;
        }
        entry.filters = filters;
        match self.write_json(key, &index).await {
            Ok(()) => tracing::debug!(list = name, %key, "Index filters updated"),
            Err(err) => tracing::warn!(error = ?err, %key, "Failed to write enriched index"),
        }
    }

    async fn snapshot(&self, pointer: &LatestPointer) -> Result<Arc<Snapshot>> {
        let key = pointer.snapshot.source_key.clone();
        let service = self.clone();
        let load_key = key.clone();
        self.inner
            .snapshots
            .get_or_load(&key, move || async move {
                service.load_snapshot(&load_key).await.map(Arc::new).map_err(|err| (*err).clone())
            })
            .await
            .map_err(Error::from)
    }

    #[instrument(skip(self))]
    async fn load_snapshot(&self, key: &str) -> Result<Snapshot> {
        let compressed = self
            .read_bytes(key)
            .await?
            .ok_or_raise(|| ErrorKind::InvalidData(format!("snapshot not found: {key}")))?;
        let encoded = Compression::decompress_detected(&compressed)
            .or_raise(|| ErrorKind::InvalidData(format!("snapshot {key} is corrupt")))?;
        serde_json::from_slice(&encoded).or_raise(|| ErrorKind::InvalidData(format!("snapshot {key} is malformed")))
    }

    async fn resolved(&self, pointer: &LatestPointer) -> Result<ResolvedLists> {
        let service = self.clone();
        let loaded = pointer.clone();
        self.inner
            .resolved
            .get_or_load(pointer.etag(), move || async move {
                let snapshot = service.snapshot(&loaded).await.map_err(|err| (*err).clone())?;
                let etag = loaded.etag().to_string();
                tokio::task::spawn_blocking(move || build_resolved_lists(&snapshot.lists))
                    .await
                    .map_err(|err| ErrorKind::Build(format!("resolution task failed: {err}")))?
                    .map(Arc::new)
                    .map_err(|err| ErrorKind::Build(format!("snapshot {etag} failed to resolve: {}", &*err)))
            })
            .await
            .map_err(Error::from)
    }

    async fn read_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner
            .storage
            .read_optional(Path::new(key))
            .await
            .or_raise(|| ErrorKind::Storage(format!("failed to read {key}")))
    }

    async fn read_text(&self, key: &str) -> Result<Option<String>> {
        self.read_bytes(key)
            .await?
            .map(|bytes| String::from_utf8(bytes).or_raise(|| ErrorKind::InvalidData(format!("{key} is not UTF-8"))))
            .transpose()
    }

    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.read_bytes(key)
            .await?
            .map(|bytes| {
                serde_json::from_slice(&bytes).or_raise(|| ErrorKind::InvalidData(format!("{key} is malformed")))
            })
            .transpose()
    }

    async fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        self.inner
            .storage
            .write(Path::new(key), data)
            .await
            .or_raise(|| ErrorKind::Storage(format!("failed to write {key}")))
    }

    async fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let mut encoded =
            serde_json::to_vec(value).or_raise(|| ErrorKind::InvalidData(format!("failed to encode {key}")))?;
        encoded.push(b'\n');
        self.write(key, &encoded).await
    }
}

/// Split `name[@filter]`, lowercased; an empty filter means none.
pub fn split_name_filter(input: &str) -> Result<(String, Option<String>)> {
    let normalized = input.trim().to_lowercase();
    let (name, filter) = match normalized.split_once('@') {
        Some((name, "")) => (name.to_string(), None),
        Some((name, filter)) => (name.to_string(), Some(filter.to_string())),
        None => (normalized.clone(), None),
    };
    if !keys::is_valid_name(&name) || filter.as_deref().is_some_and(|filter| !keys::is_valid_name(filter)) {
        exn::bail!(ErrorKind::InvalidName(normalized));
    }
    Ok((name, filter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockUpstream, tarball};
    use crate::models::RefreshReason;
    use crate::upstream::Download;
    use async_trait::async_trait;
    use geosite_storage::StorageBackend;
    use geosite_storage::backend::MockBackend;
    use rstest::rstest;
    use std::time::Duration;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2026-03-01 12:00 UTC);
    const LISTS: [(&str, &str); 3] = [
        ("cn", "include:google @cn\nbaidu.com"),
        ("google", "google.com\ngoogle.cn @cn\nfull:www.google.com"),
        ("ads", "ads.example @ads"),
    ];

    struct Fixture {
        storage: Arc<MockBackend>,
        upstream: Arc<MockUpstream>,
        service: GeositeService,
    }
    impl Fixture {
        fn new(etag: Option<&str>) -> Self {
            let storage = Arc::new(MockBackend::default());
            let upstream = Arc::new(MockUpstream::new(etag, LISTS));
            let service = GeositeService::with_clock(
                storage.clone(),
                upstream.clone(),
                ServiceOptions::default(),
                Arc::new(|| NOW),
            );
            Self { storage, upstream, service }
        }

        async fn published(etag: &str) -> Self {
            let fixture = Self::new(Some(etag));
            fixture.service.refresh().await.unwrap();
            fixture
        }

        async fn exists(&self, key: &str) -> bool {
            self.storage.exists(Path::new(key)).await.unwrap()
        }

        async fn pointer(&self) -> LatestPointer {
            self.service.pointer().await.unwrap().unwrap()
        }

        async fn index(&self) -> Index {
            let pointer = self.pointer().await;
            serde_json::from_slice(&self.storage.read(Path::new(&pointer.snapshot.index_key)).await.unwrap()).unwrap()
        }

        /// Wait for work spawned by a request to land in storage.
        async fn wait_for(&self, key: &str) {
            for _ in 0..200 {
                if self.exists(key).await {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("{key} was never written");
        }
    }

    #[tokio::test]
    async fn test_refresh_publishes_snapshot() {
        let fixture = Fixture::new(Some("v1"));
        let outcome = fixture.service.refresh().await.unwrap();
        assert_eq!(outcome, RefreshOutcome::updated(NOW, "v1", 3));

        let pointer = fixture.pointer().await;
        assert_eq!(pointer.etag(), "v1");
        assert_eq!(pointer.upstream.url, "https://upstream.test/master.tar.gz");
        assert_eq!(pointer.snapshot.source_key, "snapshots/v1/sources.json.gz");
        assert_eq!(pointer.snapshot.list_count, 3);
        assert_eq!(pointer.previous_etag, None);

        let compressed = fixture.storage.read(Path::new(&pointer.snapshot.source_key)).await.unwrap();
        assert_eq!(Compression::from_magic_bytes(&compressed), Compression::Gzip);
        let snapshot: Snapshot = serde_json::from_slice(&Compression::decompress_detected(&compressed).unwrap()).unwrap();
        assert_eq!(snapshot.lists.keys().collect::<Vec<_>>(), ["ads", "cn", "google"]);

        let index = fixture.index().await;
        assert_eq!(index["cn"].display_name, "CN");
        assert!(index["cn"].filters.is_empty());
        assert_eq!(index["cn"].modes[&Mode::Strict], "rules/strict/cn.txt");
    }

    #[tokio::test]
    async fn test_unchanged_head_skips_download() {
        let fixture = Fixture::published("v1").await;
        let latest = fixture.storage.read(Path::new(keys::LATEST)).await.unwrap();
        let sources = fixture.storage.read(Path::new("snapshots/v1/sources.json.gz")).await.unwrap();
        let index = fixture.storage.read(Path::new("snapshots/v1/index/geosite.json")).await.unwrap();

        let outcome = fixture.service.refresh().await.unwrap();
        assert!(!outcome.updated);
        assert_eq!(outcome.reason, RefreshReason::EtagUnchanged);
        assert_eq!(outcome.etag, "v1");
        assert_eq!(fixture.upstream.heads(), 2);
        assert_eq!(fixture.upstream.fetches(), 1);
        // Same clock, same inputs: nothing durable changes.
        assert_eq!(fixture.pointer().await.checked_at, NOW);
        assert_eq!(fixture.storage.read(Path::new(keys::LATEST)).await.unwrap(), latest);
        assert_eq!(fixture.storage.read(Path::new("snapshots/v1/sources.json.gz")).await.unwrap(), sources);
        assert_eq!(fixture.storage.read(Path::new("snapshots/v1/index/geosite.json")).await.unwrap(), index);
        assert_eq!(fixture.storage.list(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_new_etag_is_published_over_old() {
        let fixture = Fixture::published("v1").await;
        fixture.upstream.publish(Some("v2"), [("cn", "baidu.com\nqq.com")]);
        let outcome = fixture.service.refresh().await.unwrap();
        assert_eq!(outcome, RefreshOutcome::updated(NOW, "v2", 1));
        let pointer = fixture.pointer().await;
        assert_eq!(pointer.etag(), "v2");
        assert_eq!(pointer.previous_etag.as_deref(), Some("v1"));
        // Older snapshots stay addressable.
        assert!(fixture.exists("snapshots/v1/sources.json.gz").await);
    }

    #[tokio::test]
    async fn test_missing_etag_falls_back_to_content_hash() {
        let fixture = Fixture::new(None);
        let first = fixture.service.refresh().await.unwrap();
        assert!(first.updated);
        assert_eq!(first.etag.len(), 64);
        let second = fixture.service.refresh().await.unwrap();
        assert!(!second.updated);
        assert_eq!(second.etag, first.etag);
        assert_eq!(fixture.upstream.fetches(), 2);
    }

    #[tokio::test]
    async fn test_invalid_snapshot_is_never_published() {
        let fixture = Fixture::published("v1").await;
        fixture.upstream.publish(Some("v2"), [("a", "include:b"), ("b", "include:a")]);
        let err = fixture.service.refresh().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Validation(_)));
        assert_eq!(fixture.pointer().await.etag(), "v1");
        assert!(!fixture.exists("snapshots/v2/sources.json.gz").await);
    }

    #[tokio::test]
    async fn test_archive_without_lists_is_rejected() {
        let fixture = Fixture::new(Some("v1"));
        fixture.upstream.publish_raw(Some("v1"), tarball([("repo-master/README.md", "# lists")]));
        let err = fixture.service.refresh().await.unwrap_err();
        assert_eq!(*err, ErrorKind::EmptyArchive);
        assert!(fixture.service.pointer().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upstream_failure_keeps_pointer() {
        let fixture = Fixture::published("v1").await;
        fixture.upstream.set_failing(true);
        let err = fixture.service.refresh().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(fixture.pointer().await.etag(), "v1");
    }

    /// Moves the pointer to a rival etag while our download is in progress.
    /// Moves the published pointer to a `rival` etag while a refresh is
    /// talking to upstream.
    struct RacingUpstream {
        inner: MockUpstream,
        storage: Arc<MockBackend>,
        during_head: bool,
    }
    impl RacingUpstream {
        async fn advance_pointer(&self) {
            let latest = Path::new(keys::LATEST);
            let mut pointer: LatestPointer = serde_json::from_slice(&self.storage.read(latest).await.unwrap()).unwrap();
            pointer.upstream.etag = "rival".to_string();
            pointer.checked_at = datetime!(2026-03-01 11:00 UTC);
            self.storage.write(latest, &serde_json::to_vec(&pointer).unwrap()).await.unwrap();
        }
    }
    #[async_trait]
    impl Upstream for RacingUpstream {
        fn url(&self) -> &str {
            self.inner.url()
        }

        async fn head(&self) -> Result<Option<String>> {
            if self.during_head {
                self.advance_pointer().await;
            }
            self.inner.head().await
        }

        async fn fetch(&self) -> Result<Download> {
            if !self.during_head {
                self.advance_pointer().await;
            }
            self.inner.fetch().await
        }
    }

    #[rstest]
    #[case::before_publish("v2", false)]
    #[case::before_check("v1", true)]
    #[tokio::test]
    async fn test_refresh_yields_to_concurrent_publication(
        #[case] upstream_etag: &str,
        #[case] during_head: bool,
    ) {
        let fixture = Fixture::published("v1").await;
        let racing = Arc::new(RacingUpstream {
            inner: MockUpstream::new(Some(upstream_etag), LISTS),
            storage: Arc::clone(&fixture.storage),
            during_head,
        });
        let service =
            GeositeService::with_clock(fixture.storage.clone(), racing, ServiceOptions::default(), Arc::new(|| NOW));
        let outcome = service.refresh().await.unwrap();
        assert!(!outcome.updated);
        assert_eq!(outcome.etag, "rival");
        let pointer = fixture.pointer().await;
        assert_eq!(pointer.etag(), "rival");
        assert_eq!(pointer.checked_at, datetime!(2026-03-01 11:00 UTC));
    }

    #[tokio::test]
    async fn test_refresh_accepts_upstream_regexp_dialect() {
        let fixture = Fixture::new(Some("v1"));
        fixture.upstream.publish(
            Some("v1"),
            [("cn", "baidu.com\nregexp:^(?<n>x)\\k<n>\\.example\\.com$\nregexp:^[^]+\\.cn{$")],
        );
        let outcome = fixture.service.refresh().await.unwrap();
        assert!(outcome.updated);
        assert_eq!(fixture.pointer().await.etag(), "v1");
        let served = fixture.service.request(Mode::Strict, "cn").await.unwrap();
        assert_eq!(served.body, "DOMAIN-SUFFIX,baidu.com\n");
    }

    #[rstest]
    #[case("cn", "cn", None)]
    #[case("  CN ", "cn", None)]
    #[case("Google@CN", "google", Some("cn"))]
    #[case("google@", "google", None)]
    #[case("category-ads-all@ads", "category-ads-all", Some("ads"))]
    fn test_split_name_filter(#[case] input: &str, #[case] name: &str, #[case] filter: Option<&str>) {
        assert_eq!(split_name_filter(input).unwrap(), (name.to_string(), filter.map(ToString::to_string)));
    }

    #[rstest]
    #[case("")]
    #[case("bad name")]
    #[case("../etc")]
    #[case("cn@a b")]
    #[case("@cn")]
    #[tokio::test]
    async fn test_invalid_names_rejected_first(#[case] input: &str) {
        let fixture = Fixture::new(Some("v1"));
        let err = fixture.service.request(Mode::Balanced, input).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidName(_)));
    }

    #[tokio::test]
    async fn test_request_before_first_refresh() {
        let fixture = Fixture::new(Some("v1"));
        let err = fixture.service.request(Mode::Balanced, "cn").await.unwrap_err();
        assert_eq!(*err, ErrorKind::NotReady);
        let err = fixture.service.index().await.unwrap_err();
        assert_eq!(*err, ErrorKind::NotReady);
    }

    #[tokio::test]
    async fn test_request_builds_once_then_serves_stored() {
        let fixture = Fixture::published("v1").await;
        let served = fixture.service.request(Mode::Balanced, "CN").await.unwrap();
        assert_eq!(served.body, "DOMAIN-SUFFIX,baidu.com\nDOMAIN-SUFFIX,google.cn\n");
        assert_eq!(served.etag, "v1");
        assert_eq!(served.list, "cn");
        assert!(!served.stale);
        assert!(fixture.exists("artifacts/v1/balanced/cn.txt").await);

        let again = fixture.service.request(Mode::Balanced, "cn").await.unwrap();
        assert_eq!(again.body, served.body);
        assert_eq!(fixture.service.builds(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_build() {
        let fixture = Fixture::published("v1").await;
        let requests = (0..8).map(|_| fixture.service.request(Mode::Full, "google"));
        let served = futures::future::join_all(requests).await;
        for served in served {
            assert_eq!(served.unwrap().body, "DOMAIN-SUFFIX,google.cn\nDOMAIN-SUFFIX,google.com\n");
        }
        assert_eq!(fixture.service.builds(), 1);
    }

    #[tokio::test]
    async fn test_unknown_list() {
        let fixture = Fixture::published("v1").await;
        let err = fixture.service.request(Mode::Balanced, "nope").await.unwrap_err();
        assert_eq!(*err, ErrorKind::ListNotFound("nope".to_string()));
        assert_eq!(fixture.service.builds(), 0);

        // Without an index the build itself finds out.
        fixture.storage.delete(Path::new("snapshots/v1/index/geosite.json")).await.unwrap();
        let err = fixture.service.request(Mode::Balanced, "nope").await.unwrap_err();
        assert_eq!(*err, ErrorKind::ListNotFound("nope".to_string()));
        assert!(!fixture.exists("artifacts/v1/balanced/nope.txt").await);
    }

    #[tokio::test]
    async fn test_filters_and_index_enrichment() {
        let fixture = Fixture::published("v1").await;
        let served = fixture.service.request(Mode::Balanced, "google@cn").await.unwrap();
        assert_eq!(served.body, "DOMAIN-SUFFIX,google.cn\n");
        assert_eq!(served.filter.as_deref(), Some("cn"));
        fixture.wait_for("artifacts/v1/balanced/google@cn.txt").await;

        // Unknown filters answer empty and are not stored.
        let served = fixture.service.request(Mode::Balanced, "google@ads").await.unwrap();
        assert_eq!(served.body, "");
        assert!(!fixture.exists("artifacts/v1/balanced/google@ads.txt").await);

        for _ in 0..200 {
            if !fixture.index().await["google"].filters.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let index = fixture.index().await;
        assert_eq!(index["google"].filters, ["cn"]);
        assert!(index["ads"].filters.is_empty());
    }

    #[tokio::test]
    async fn test_previous_artifact_served_while_building() {
        let fixture = Fixture::published("v1").await;
        let old = fixture.service.request(Mode::Balanced, "cn").await.unwrap();

        fixture.upstream.publish(Some("v2"), [("cn", "baidu.com\nqq.com")]);
        fixture.service.refresh().await.unwrap();
        let stale = fixture.service.request(Mode::Balanced, "cn").await.unwrap();
        assert!(stale.stale);
        assert_eq!(stale.etag, "v1");
        assert_eq!(stale.body, old.body);

        fixture.wait_for("artifacts/v2/balanced/cn.txt").await;
        let fresh = fixture.service.request(Mode::Balanced, "cn").await.unwrap();
        assert!(!fresh.stale);
        assert_eq!(fresh.etag, "v2");
        assert_eq!(fresh.body, "DOMAIN-SUFFIX,baidu.com\nDOMAIN-SUFFIX,qq.com\n");
    }

    #[tokio::test]
    async fn test_filtered_requests_are_never_stale() {
        let fixture = Fixture::published("v1").await;
        fixture.service.request(Mode::Balanced, "google@cn").await.unwrap();
        fixture.upstream.publish(Some("v2"), [("google", "google.de @cn")]);
        fixture.service.refresh().await.unwrap();
        let served = fixture.service.request(Mode::Balanced, "google@cn").await.unwrap();
        assert!(!served.stale);
        assert_eq!(served.body, "DOMAIN-SUFFIX,google.de\n");
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_retried() {
        let fixture = Fixture::published("v1").await;
        let key = Path::new("snapshots/v1/sources.json.gz");
        let original = fixture.storage.read(key).await.unwrap();
        fixture.storage.write(key, b"not a snapshot").await.unwrap();
        let err = fixture.service.request(Mode::Strict, "cn").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidData(_)));

        fixture.storage.write(key, &original).await.unwrap();
        let served = fixture.service.request(Mode::Strict, "cn").await.unwrap();
        assert_eq!(served.body, "DOMAIN-SUFFIX,baidu.com\nDOMAIN-SUFFIX,google.cn\n");
    }

    #[tokio::test]
    async fn test_missing_index_is_rebuilt() {
        let fixture = Fixture::published("v1").await;
        let key = "snapshots/v1/index/geosite.json";
        fixture.storage.delete(Path::new(key)).await.unwrap();
        let view = fixture.service.index().await.unwrap();
        assert_eq!(view.pointer.etag(), "v1");
        assert_eq!(view.index.keys().collect::<Vec<_>>(), ["ads", "cn", "google"]);
        assert!(fixture.exists(key).await);
    }
}
