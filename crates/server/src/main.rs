//! HTTP server for a log-replicated SQLite replica.
//!
//! Reads are answered from the local database; writes are published to the
//! ordered log and applied by every replica's consumer.

use anyhow::{Context, Result, bail};
use blobstore::{DirObjectStore, HttpObjectStore, ObjectStore};
use clap::{Parser, ValueEnum};
use common::{DEFAULT_APP, DEFAULT_DATA_DIR, DEFAULT_SNAPSHOT_THRESHOLD, NodeConfig};
use replication::Node;
use server::logging::{self, LogFormat};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stream::{FileStream, LogService};
use tracing::{error, info, warn};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 4001;
const DEFAULT_SNAPSHOT_INTERVAL_HOURS: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackupKind {
    /// PUT/GET snapshots to an HTTP endpoint.
    Http,
}

#[derive(Parser, Debug)]
#[command(name = "logsql-server", about = "Log-replicated SQLite replica")]
struct Args {
    /// Host address to bind to
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Port to listen on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory holding the database file and node identity
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Application name; names the stream and the publish subject
    #[arg(long, default_value = DEFAULT_APP)]
    app: String,

    /// Directory of the durable log (default: <data-dir>/stream)
    #[arg(long)]
    stream_dir: Option<PathBuf>,

    /// Directory of the snapshot store (default: <data-dir>/objects)
    #[arg(long)]
    object_dir: Option<PathBuf>,

    /// Store snapshots in an external backup service instead of a local directory
    #[arg(long, value_enum, requires = "external_backup_url")]
    external_backup: Option<BackupKind>,

    /// Base URL of the external backup service
    #[arg(long)]
    external_backup_url: Option<String>,

    /// Bearer token for the external backup service
    #[arg(long, conflicts_with = "creds")]
    token: Option<String>,

    /// File containing the bearer token for the external backup service
    #[arg(long)]
    creds: Option<PathBuf>,

    /// Hours between snapshot attempts
    #[arg(long, default_value_t = DEFAULT_SNAPSHOT_INTERVAL_HOURS)]
    snapshot_interval_hours: f64,

    /// Entries applied since the last snapshot before a new one is taken
    #[arg(long, default_value_t = DEFAULT_SNAPSHOT_THRESHOLD)]
    snapshot_threshold: u64,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

impl Args {
    fn node_config(&self) -> Result<NodeConfig> {
        if !self.snapshot_interval_hours.is_finite() || self.snapshot_interval_hours < 0.0 {
            bail!("--snapshot-interval-hours must be a non-negative number");
        }
        if self.snapshot_threshold == 0 {
            bail!("--snapshot-threshold must be greater than zero");
        }
        Ok(NodeConfig::builder()
            .data_dir(self.data_dir.clone())
            .app(self.app.clone())
            .snapshot_interval(Duration::from_secs_f64(self.snapshot_interval_hours * 3600.0))
            .snapshot_threshold(self.snapshot_threshold)
            .build())
    }

    fn token(&self) -> Result<Option<String>> {
        if let Some(token) = &self.token {
            return Ok(Some(token.clone()));
        }
        let Some(path) = &self.creds else {
            return Ok(None);
        };
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading credentials from {}", path.display()))?;
        let token = contents.trim();
        if token.is_empty() {
            bail!("credentials file {} is empty", path.display());
        }
        Ok(Some(token.to_string()))
    }

    fn object_store(&self) -> Result<Arc<dyn ObjectStore>> {
        match (self.external_backup, &self.external_backup_url) {
            (Some(BackupKind::Http), Some(url)) => {
                let token = self.token()?;
                if token.is_none() {
                    warn!("no --token or --creds given; backup requests are unauthenticated");
                }
                info!(url = %url, "using external HTTP backup");
                Ok(Arc::new(HttpObjectStore::new(url.clone(), token)?))
            }
            (Some(BackupKind::Http), None) => bail!("--external-backup http requires --external-backup-url"),
            (None, _) => {
                let dir = self
                    .object_dir
                    .clone()
                    .unwrap_or_else(|| self.data_dir.join("objects"));
                info!(dir = %dir.display(), "using local snapshot directory");
                Ok(Arc::new(DirObjectStore::open(&dir)?))
            }
        }
    }

    fn log_service(&self) -> Result<Arc<dyn LogService>> {
        let dir = self
            .stream_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("stream"));
        let stream = FileStream::open(&dir, self.app.clone())
            .with_context(|| format!("opening stream in {}", dir.display()))?;
        Ok(Arc::new(stream))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.log_format);

    let config = args.node_config()?;
    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", args.host, args.port))?;

    let log = args.log_service()?;
    let objects = args.object_store()?;
    let node = Node::start(config, log, objects)
        .await
        .context("starting node")?;

    let mut server = server::start_server(addr, node.context().clone())
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %server.local_addr(), node = %node.node_id(), "server listening");

    let consumer = node.consumer().clone();
    tokio::select! {
        signal = shutdown_signal() => {
            signal?;
            info!("shutdown signal received");
        }
        _ = consumer.stopped() => {
            error!("consumer stopped unexpectedly");
        }
    }

    let node_result = node.shutdown().await;
    server.shutdown();
    server.wait().await.context("stopping server")?;

    node_result.context("node failed")?;
    info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("waiting for SIGINT")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")
}
