//! Layered configuration for the geosite binary.
//!
//! Sources, later ones winning:
//!
//! 1. Built-in defaults.
//! 2. A TOML file: the path given on the command line, else `config.toml` in
//!    the platform configuration directory (skipped when absent).
//! 3. `GEOSITE_`-prefixed environment variables, `__` separating sections
//!    (`GEOSITE_SERVER__LISTEN=0.0.0.0:8787`).

mod error;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

pub use crate::error::{Error, ErrorKind, Result};

pub const ENV_PREFIX: &str = "GEOSITE_";
pub const DEFAULT_UPSTREAM_URL: &str =
    "https://github.com/v2fly/domain-list-community/archive/refs/heads/master.tar.gz";
pub const DEFAULT_USER_AGENT: &str = concat!("geosite/", env!("CARGO_PKG_VERSION"));

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "geosite")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Tarball of the domain-list repository.
    pub url: String,
    pub user_agent: String,
    /// Seconds between scheduled refreshes.
    pub refresh_interval: u64,
}
impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_UPSTREAM_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            refresh_interval: 1800,
        }
    }
}
impl UpstreamConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}
impl Default for ServerConfig {
    fn default() -> Self {
        Self { listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 8787)) }
    }
}

/// Where snapshots and artifacts live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageConfig {
    Local {
        root: PathBuf,
    },
    /// Any S3-compatible service, Cloudflare R2 included.
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default = "default_region")]
        region: String,
        #[serde(default)]
        endpoint: Option<String>,
        key_id: String,
        key_secret: String,
    },
}
impl Default for StorageConfig {
    fn default() -> Self {
        let root = match project_dirs() {
            Some(dirs) => dirs.data_dir().join("store"),
            None => std::env::temp_dir().join("geosite"),
        };
        Self::Local { root }
    }
}

fn default_region() -> String {
    "auto".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Decompressed snapshots held in memory.
    pub snapshots: usize,
    /// Resolved list sets held in memory.
    pub resolved: usize,
}
impl Default for CacheConfig {
    fn default() -> Self {
        Self { snapshots: 2, resolved: 2 }
    }
}

impl Config {
    /// `config.toml` in the platform configuration directory.
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// The layered sources, unextracted.
    ///
    /// An explicit `path` must exist; the default path is optional.
    pub fn figment(path: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        match path {
            Some(path) if !path.is_file() => {
                exn::bail!(ErrorKind::Load(format!("config file not found: {}", path.display())));
            },
            Some(path) => figment = figment.merge(Toml::file(path)),
            None => {
                if let Some(path) = Self::default_path().filter(|path| path.is_file()) {
                    tracing::debug!(path = %path.display(), "Using default config file");
                    figment = figment.merge(Toml::file(path));
                }
            },
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Load and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::from_figment(&Self::figment(path)?)
    }

    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let config: Self = figment.extract().map_err(|err| ErrorKind::Load(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| -> Result<()> { exn::bail!(ErrorKind::Invalid(reason.to_string())) };
        if !self.upstream.url.starts_with("https://") && !self.upstream.url.starts_with("http://") {
            return invalid("upstream.url must be an http(s) URL");
        }
        if self.upstream.refresh_interval == 0 {
            return invalid("upstream.refresh_interval must be at least 1 second");
        }
        if self.cache.snapshots == 0 || self.cache.resolved == 0 {
            return invalid("cache capacities must be at least 1");
        }
        match &self.storage {
            StorageConfig::Local { root } if !root.is_absolute() => invalid("storage.root must be an absolute path"),
            StorageConfig::S3 { bucket, .. } if bucket.is_empty() => invalid("storage.bucket must not be empty"),
            StorageConfig::Local { .. } | StorageConfig::S3 { .. } => Ok(()),
        }
    }
}
