//! S3-compatible storage backend.
//!
//! Works with AWS S3, Cloudflare R2, MinIO and other S3-compatible services.
//! Credentials are provided explicitly via configuration.

use crate::{
    FileInfo, StorageBackend,
    backend::FileInfoStream,
    error::{ErrorKind, Result},
    validate_path,
};
use async_stream::stream;
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, retry::RetryConfig},
    error::{DisplayErrorContext, SdkError},
    primitives::{ByteStream, DateTime},
};
use exn::{OptionExt, ResultExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

const DEFAULT_CONCURRENT_REQUESTS: usize = 100;

/// S3-compatible storage backend.
///
/// Stores objects in a bucket, optionally under a key prefix. All keys are
/// relative to the configured prefix (if any).
///
/// # Examples
///
/// ```no_run
/// use geosite_storage::backend::S3Backend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = S3Backend::new(
///     "r2",
///     "geosite",
///     Some("prod".to_string()),
///     "auto",
///     Some("https://<account>.r2.cloudflarestorage.com".to_string()),
///     "access_key_id",
///     "secret_access_key",
/// )?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3Backend {
    name: String,
    client: Client,
    bucket: String,
    prefix: Option<String>,
    rate_limiter: Arc<Semaphore>,
}

impl S3Backend {
    /// Create a new S3 storage backend.
    ///
    /// # Arguments
    /// * `name` - A name for this backend (used in logging)
    /// * `bucket` - Bucket name
    /// * `prefix` - Optional key prefix (acts as virtual directory)
    /// * `region` - Region, `auto` for R2
    /// * `endpoint` - Custom endpoint URL for S3-compatible services
    /// * `key_id` - Access key ID
    /// * `key_secret` - Secret access key
    pub fn new(
        name: impl Into<String>,
        bucket: impl Into<String>,
        prefix: Option<String>,
        region: impl Into<String>,
        endpoint: Option<impl Into<String>>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
    ) -> Result<Self> {
        let prefix = prefix
            .map(validate_path)
            .transpose()?
            .map(|p| p.to_str().map(ToString::to_string).ok_or_raise(|| ErrorKind::InvalidPath(p.clone())))
            .transpose()?;
        let credentials = Credentials::new(key_id, key_secret, None, None, "geosite-config");
        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(region.into()))
            // 1 initial attempt + 3 retries with exponential backoff
            .retry_config(RetryConfig::standard().with_max_attempts(4))
            // Path-style addressing for S3-compatible services
            .force_path_style(true);
        if let Some(endpoint_url) = endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        Ok(Self {
            name: name.into(),
            client: Client::from_conf(config_builder.build()),
            bucket: bucket.into(),
            prefix,
            rate_limiter: Arc::new(Semaphore::new(DEFAULT_CONCURRENT_REQUESTS)),
        })
    }

    fn full_key(&self, path: &Path) -> Result<String> {
        let validated = validate_path(path)?;
        let key = validated.to_str().ok_or_raise(|| ErrorKind::InvalidPath(validated.clone()))?;
        Ok(join_key(self.prefix.as_deref(), key))
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.rate_limiter
            .clone()
            .acquire_owned()
            .await
            .or_raise(|| ErrorKind::BackendError("S3 rate limiter closed".to_string()))
    }

    fn parse_datetime(dt: Option<&DateTime>) -> Result<OffsetDateTime> {
        match dt {
            Some(dt) => OffsetDateTime::from_unix_timestamp_nanos(dt.as_nanos())
                .or_raise(|| ErrorKind::BackendError("S3 datetime out of range".to_string())),
            None => Ok(OffsetDateTime::UNIX_EPOCH),
        }
    }

    /// Classify an SDK failure; `not_found` decides whether the service
    /// error means the key is missing.
    fn map_sdk_error<E, R>(err: SdkError<E, R>, path: &Path, not_found: impl Fn(&E) -> bool) -> ErrorKind
    where
        E: std::error::Error + 'static,
        R: std::fmt::Debug,
    {
        if let Some(service) = err.as_service_error() {
            if not_found(service) {
                return ErrorKind::NotFound(path.to_path_buf());
            }
            return ErrorKind::BackendError(format!("{}", DisplayErrorContext(&err)));
        }
        let message = format!("{}", DisplayErrorContext(&err));
        match err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
                ErrorKind::Network(message)
            },
            _ => ErrorKind::BackendError(message),
        }
    }
}

/// Prefix a validated key.
fn join_key(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), key),
        None => key.to_string(),
    }
}

/// Strip the configured prefix from an object key.
fn strip_key<'k>(prefix: Option<&str>, key: &'k str) -> &'k str {
    match prefix {
        Some(prefix) => key.strip_prefix(prefix.trim_end_matches('/')).and_then(|s| s.strip_prefix('/')).unwrap_or(key),
        None => key,
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a> {
        let list_prefix = match prefix {
            Some(prefix) => match self.full_key(prefix) {
                // Component-wise matching, same as the local backend.
                Ok(key) => Some(format!("{key}/")),
                Err(e) => return Box::pin(futures::stream::once(async { Result::Err(e) })),
            },
            None => self.prefix.as_ref().map(|p| format!("{}/", p.trim_end_matches('/'))),
        };

        Box::pin(stream! {
            let mut pages = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_prefix(list_prefix)
                .into_paginator()
                .send();
            while let Some(page) = pages.next().await {
                let page = match page {
                    Ok(page) => page,
                    Err(err) => {
                        yield Err(exn::Exn::from(Self::map_sdk_error(err, Path::new(""), |_| false)));
                        break;
                    },
                };
                for object in page.contents() {
                    let Some(key) = object.key() else { continue };
                    let relative: PathBuf = match validate_path(strip_key(self.prefix.as_deref(), key)) {
                        Ok(relative) => relative,
                        Err(e) => { yield Err(e); continue; },
                    };
                    let modified = match Self::parse_datetime(object.last_modified()) {
                        Ok(modified) => modified,
                        Err(e) => { yield Err(e); continue; },
                    };
                    let size = object.size().unwrap_or_default().max(0) as u64;
                    yield Ok(FileInfo::new(relative, size, modified));
                }
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|err| Self::map_sdk_error(err, path, |e| e.is_no_such_key()))?;
        let body = output.body.collect().await.map_err(|err| ErrorKind::Network(err.to_string()))?;
        tracing::trace!(backend = %self.name, key, "S3 object read");
        Ok(body.into_bytes().to_vec())
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|err| Self::map_sdk_error(err, path, |_| false))?;
        tracing::trace!(backend = %self.name, key, bytes = data.len(), "S3 object written");
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        // S3 deletes are idempotent; check first so a missing key is an error
        // like it is on every other backend.
        self.stat(path).await?;
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|err| Self::map_sdk_error(err, path, |_| false))?;
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|err| Self::map_sdk_error(err, path, |e| e.is_not_found()))?;
        let size = output.content_length().unwrap_or_default().max(0) as u64;
        let modified = Self::parse_datetime(output.last_modified())?;
        Ok(FileInfo::new(validate_path(path)?, size, modified))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rstest::rstest]
    #[case(None, "state/latest.json", "state/latest.json")]
    #[case(Some("prod"), "state/latest.json", "prod/state/latest.json")]
    #[case(Some("prod/"), "artifacts/abc/full/cn.txt", "prod/artifacts/abc/full/cn.txt")]
    fn test_join_key(#[case] prefix: Option<&str>, #[case] key: &str, #[case] expected: &str) {
        assert_eq!(join_key(prefix, key), expected);
    }

    #[rstest::rstest]
    #[case(None, "state/latest.json", "state/latest.json")]
    #[case(Some("prod"), "prod/state/latest.json", "state/latest.json")]
    #[case(Some("prod/"), "prod/state/latest.json", "state/latest.json")]
    #[case(Some("prod"), "production/state.json", "production/state.json")]
    fn test_strip_key(#[case] prefix: Option<&str>, #[case] key: &str, #[case] expected: &str) {
        assert_eq!(strip_key(prefix, key), expected);
    }

    #[test]
    fn test_new_validates_prefix() {
        let backend = S3Backend::new("r2", "bucket", Some("prod/".to_string()), "auto", None::<String>, "id", "secret");
        assert_eq!(backend.unwrap().full_key(Path::new("state/latest.json")).unwrap(), "prod/state/latest.json");
        let err = S3Backend::new("r2", "bucket", Some("../up".to_string()), "auto", None::<String>, "id", "secret")
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPath(_)));
    }
}
