use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use jackal::c2s::C2sServer;
use jackal::config::{CacheKind, Config, LoggerConfig, StorageKind};
use jackal::host::{init_crypto_provider, Hosts};
use jackal::module::Hub;
use jackal::router::Router;
use jackal::storage::{CachedRepository, MemoryCache, MemoryRepository, Repository};

#[derive(Debug, Parser)]
#[command(name = "jackal", version, about = "XMPP client-to-server daemon")]
struct Args {
    /// Configuration file.
    #[arg(short, long, env = "JACKAL_CONFIG", default_value = "jackal.toml")]
    config: PathBuf,

    /// Also log to stderr.
    #[arg(short, long)]
    verbose: bool,
}

fn log_dir(config: &LoggerConfig) -> PathBuf {
    config.log_path.clone().unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("jackal")
            .join("logs")
    })
}

fn init_logging(config: &LoggerConfig, verbose: bool) -> PathBuf {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let log_dir = log_dir(config);
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
    }

    let filter = || {
        if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new(&config.level)
        }
    };

    let file_appender = tracing_appender::rolling::daily(&log_dir, "jackal.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(filter());

    let stderr_layer = verbose.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(filter())
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    // The writer thread must outlive every log call.
    std::mem::forget(_guard);
    log_dir
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        Config::load(path).with_context(|| format!("loading {}", path.display()))
    } else {
        eprintln!("Config file '{}' not found, using defaults", path.display());
        Ok(Config::default())
    }
}

fn build_repository(config: &Config) -> Arc<dyn Repository> {
    let repo: Arc<dyn Repository> = match config.storage.kind {
        StorageKind::Memory => Arc::new(MemoryRepository::new()),
    };
    match config.cache.kind {
        CacheKind::Memory => Arc::new(CachedRepository::new(
            repo,
            Arc::new(MemoryCache::new(config.cache.ttl)),
        )),
        CacheKind::None => repo,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args.config)?;
    let log_dir = init_logging(&config.logger, args.verbose);
    eprintln!("Log file: {}", log_dir.display());

    init_crypto_provider();
    let hosts = Hosts::new(&config.hosts)?;
    let repo = build_repository(&config);
    repo.start().await.context("starting repository")?;

    let router = Router::new(hosts, repo.clone());
    let hub = Arc::new(Hub::new(&config.modules, router.clone()));
    hub.start().await.context("starting modules")?;

    let mut servers = Vec::with_capacity(config.c2s.len());
    for c2s in &config.c2s {
        let mut server = C2sServer::new(c2s.clone(), router.clone(), hub.clone());
        server
            .start()
            .await
            .with_context(|| format!("starting c2s listener {}", c2s.id))?;
        servers.push(server);
    }
    info!(version = env!("CARGO_PKG_VERSION"), listeners = servers.len(), "jackal is running");

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutting down");

    for server in &mut servers {
        server.stop().await;
    }
    hub.stop().await;
    if let Err(e) = repo.stop().await {
        error!(error = %e, "failed to stop repository");
    }
    Ok(())
}
