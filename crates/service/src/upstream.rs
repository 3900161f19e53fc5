//! The upstream archive source.

use async_trait::async_trait;
use exn::ResultExt;
use reqwest::{Client, StatusCode, header::ETAG};
use tracing::instrument;

use crate::error::{ErrorKind, Result};

/// A downloaded archive and the validator it was served with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    /// Raw `ETag` header, if any.
    pub etag: Option<String>,
    pub body: Vec<u8>,
}

/// Where snapshots come from.
#[async_trait]
pub trait Upstream: Send + Sync {
    fn url(&self) -> &str;

    /// Check the archive without downloading it, returning the raw `ETag`
    /// header if the server sent one.
    async fn head(&self) -> Result<Option<String>>;

    /// Download the whole archive.
    async fn fetch(&self) -> Result<Download>;
}

/// Upstream served over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: Client,
    url: String,
}
impl HttpUpstream {
    pub fn new(url: impl Into<String>, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .build()
            .or_raise(|| ErrorKind::Upstream("failed to build HTTP client".to_string()))?;
        Ok(Self { client, url: url.into() })
    }

    fn check_status(&self, action: &str, status: StatusCode) -> Result<()> {
        if !status.is_success() {
            exn::bail!(ErrorKind::Upstream(format!("failed to {action} upstream archive {}: {status}", self.url)));
        }
        Ok(())
    }

    fn etag(response: &reqwest::Response) -> Option<String> {
        response.headers().get(ETAG).and_then(|value| value.to_str().ok()).map(ToString::to_string)
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    fn url(&self) -> &str {
        &self.url
    }

    #[instrument(skip(self), fields(url = %self.url))]
    async fn head(&self) -> Result<Option<String>> {
        let response = self
            .client
            .head(&self.url)
            .send()
            .await
            .or_raise(|| ErrorKind::Upstream(format!("failed to check upstream archive {}", self.url)))?;
        self.check_status("check", response.status())?;
        Ok(Self::etag(&response))
    }

    #[instrument(skip(self), fields(url = %self.url, bytes))]
    async fn fetch(&self) -> Result<Download> {
        let download_failed = || ErrorKind::Upstream(format!("failed to download upstream archive {}", self.url));
        let response = self.client.get(&self.url).send().await.or_raise(download_failed)?;
        self.check_status("download", response.status())?;
        let etag = Self::etag(&response);
        let body = response.bytes().await.or_raise(download_failed)?;
        tracing::Span::current().record("bytes", body.len());
        Ok(Download { etag, body: body.to_vec() })
    }
}
