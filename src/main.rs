//! `geosite`: serve, refresh and build Surge rule sets from geosite lists.

mod build;
mod error;
mod http;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use exn::ResultExt;
use geosite_config::{Config, StorageConfig};
use geosite_service::{GeositeService, HttpUpstream, ServiceOptions};
use geosite_storage::BackendHandle;
use geosite_storage::backend::LocalBackend;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

use crate::build::BuildOptions;
use crate::error::{ErrorKind, Result};

#[derive(Debug, Parser)]
#[command(name = "geosite", version, about = "Geosite domain lists as Surge rule sets", long_about = None)]
struct Cli {
    /// Configuration file; defaults to `config.toml` in the platform config directory.
    #[arg(short, long, global = true, env = "GEOSITE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve rule sets over HTTP and refresh from upstream on a schedule.
    Serve,
    /// Check upstream once, publish a new snapshot if it changed, and print the outcome.
    Refresh,
    /// Render lists from a local data directory into static files.
    Build {
        /// Directory of list files (the `data` directory of domain-list-community).
        #[arg(long)]
        data_dir: PathBuf,
        #[arg(long, default_value = "out")]
        out_dir: PathBuf,
        /// Comma-separated lists to build; all of them when omitted.
        #[arg(long, value_delimiter = ',')]
        list: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = ?err, "Command failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        },
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Build { data_dir, out_dir, list } => {
            let options = BuildOptions { data_dir, out_dir, lists: list };
            let summary = build::run(&options, OffsetDateTime::now_utc()).await?;
            println!("generated lists={} output={}", summary.lists, summary.out_dir.display());
            Ok(())
        },
        Command::Serve => {
            let config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
            serve(&config, service(&config)?).await
        },
        Command::Refresh => {
            let config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
            let outcome = service(&config)?.refresh().await.or_raise(|| ErrorKind::Service)?;
            let json = serde_json::to_string_pretty(&outcome).or_raise(|| ErrorKind::Service)?;
            println!("{json}");
            Ok(())
        },
    }
}

fn storage(config: &StorageConfig) -> Result<BackendHandle> {
    match config {
        StorageConfig::Local { root } => {
            let backend = LocalBackend::new("local", root)
                .or_raise(|| ErrorKind::Storage(format!("cannot use {}", root.display())))?;
            Ok(Arc::new(backend))
        },
        #[cfg(feature = "s3")]
        StorageConfig::S3 { bucket, prefix, region, endpoint, key_id, key_secret } => {
            let backend = geosite_storage::backend::S3Backend::new(
                "s3",
                bucket,
                prefix.clone(),
                region,
                endpoint.clone(),
                key_id,
                key_secret,
            )
            .or_raise(|| ErrorKind::Storage(format!("cannot use bucket {bucket}")))?;
            Ok(Arc::new(backend))
        },
        #[cfg(not(feature = "s3"))]
        StorageConfig::S3 { .. } => exn::bail!(ErrorKind::Storage("built without the `s3` feature".to_string())),
    }
}

fn service(config: &Config) -> Result<GeositeService> {
    let upstream = HttpUpstream::new(&config.upstream.url, &config.upstream.user_agent)
        .or_raise(|| ErrorKind::Service)?;
    let options = ServiceOptions { snapshot_cache: config.cache.snapshots, resolved_cache: config.cache.resolved };
    Ok(GeositeService::new(storage(&config.storage)?, Arc::new(upstream), options))
}

/// Refresh now and then every interval; failures are logged and retried on
/// the next tick.
async fn refresh_loop(service: GeositeService, every: std::time::Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(err) = service.refresh().await {
            tracing::warn!(error = ?err, retryable = err.is_retryable(), "Scheduled refresh failed");
        }
    }
}

async fn serve(config: &Config, service: GeositeService) -> Result<()> {
    let listen = config.server.listen;
    let refresher = tokio::spawn(refresh_loop(service.clone(), config.upstream.refresh_interval()));

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .or_raise(|| ErrorKind::Server(format!("failed to bind {listen}")))?;
    tracing::info!(%listen, upstream = %config.upstream.url, "Serving geosite rule sets");
    let served = axum::serve(listener, http::router(service))
        .with_graceful_shutdown(shutdown())
        .await
        .or_raise(|| ErrorKind::Server("listener failed".to_string()));
    refresher.abort();
    served
}

async fn shutdown() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
