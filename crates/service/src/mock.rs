//! Scripted upstream and archive helpers for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use geosite_compress::Compression;

use crate::error::{ErrorKind, Result};
use crate::upstream::{Download, Upstream};

/// Build a gzip-compressed tarball from `(path, contents)` pairs.
///
/// Panics on failure; test setup that can't build its fixture should not pass.
pub fn tarball<'a>(files: impl IntoIterator<Item = (&'a str, &'a str)>) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, path, contents.as_bytes()).expect("append tar entry");
    }
    let tar = builder.into_inner().expect("finish tarball");
    Compression::Gzip.compress(&tar).expect("gzip tarball")
}

/// Tarball with every list under `repo-master/data/`.
pub fn data_tarball<'a>(lists: impl IntoIterator<Item = (&'a str, &'a str)>) -> Vec<u8> {
    let files: Vec<(String, &str)> =
        lists.into_iter().map(|(name, text)| (format!("repo-master/data/{name}"), text)).collect();
    tarball(files.iter().map(|(path, text)| (path.as_str(), *text)))
}

#[derive(Debug, Default)]
struct Published {
    etag: Option<String>,
    body: Vec<u8>,
    failing: bool,
}

/// An upstream whose archive and etag are set by the test.
#[derive(Debug, Default)]
pub struct MockUpstream {
    url: String,
    published: Mutex<Published>,
    heads: AtomicUsize,
    fetches: AtomicUsize,
}
impl MockUpstream {
    pub fn new<'a>(etag: Option<&str>, lists: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let upstream = Self { url: "https://upstream.test/master.tar.gz".to_string(), ..Self::default() };
        upstream.publish(etag, lists);
        upstream
    }

    /// Replace the archive served from now on.
    pub fn publish<'a>(&self, etag: Option<&str>, lists: impl IntoIterator<Item = (&'a str, &'a str)>) {
        self.publish_raw(etag, data_tarball(lists));
    }

    pub fn publish_raw(&self, etag: Option<&str>, body: Vec<u8>) {
        let mut published = self.published();
        published.etag = etag.map(ToString::to_string);
        published.body = body;
    }

    /// Make every request fail until called again with `false`.
    pub fn set_failing(&self, failing: bool) {
        self.published().failing = failing;
    }

    pub fn heads(&self) -> usize {
        self.heads.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn published(&self) -> MutexGuard<'_, Published> {
        self.published.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Upstream for MockUpstream {
    fn url(&self) -> &str {
        &self.url
    }

    async fn head(&self) -> Result<Option<String>> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        let published = self.published();
        if published.failing {
            exn::bail!(ErrorKind::Upstream("503 Service Unavailable".to_string()));
        }
        Ok(published.etag.as_ref().map(|etag| format!("\"{etag}\"")))
    }

    async fn fetch(&self) -> Result<Download> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let published = self.published();
        if published.failing {
            exn::bail!(ErrorKind::Upstream("503 Service Unavailable".to_string()));
        }
        Ok(Download { etag: published.etag.as_ref().map(|etag| format!("\"{etag}\"")), body: published.body.clone() })
    }
}
