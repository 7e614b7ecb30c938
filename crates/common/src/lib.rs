#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::{
    io,
    path::PathBuf,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;

/// Stream name and subject prefix used when no application name is configured.
pub const DEFAULT_APP: &str = "logsql";
/// Default directory for the database file, node uid and local backends.
pub const DEFAULT_DATA_DIR: &str = ".logsql-data";
/// Object store key the snapshot blob is written under.
pub const SNAPSHOT_KEY: &str = "snapshot";
/// Entries that must be applied since the last snapshot before a new one is taken.
pub const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 1024;
/// Name of the replica database inside the data directory.
pub const DB_FILE: &str = "logsql.db";
/// Name of the file holding the node's durable identity.
pub const UID_FILE: &str = "uid";

/// Canonical error type shared across the replica subsystems.
///
/// Each variant maps to one propagation policy: validation and publish
/// errors go back to the HTTP caller, apply errors are skipped by the
/// consumer, transport errors restart the subscription, snapshot errors end
/// the cycle, and storage errors are fatal.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("apply: {0}")]
    Apply(String),
    #[error("publish: {0}")]
    Publish(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("snapshot: {0}")]
    Snapshot(String),
    #[error("storage: {0}")]
    Storage(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DbError {
    /// Errors after which the local database cannot be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DbError::Storage(_) | DbError::Io(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, DbError::Transport(_))
    }
}

/// Result alias that carries a `DbError`.
pub type DbResult<T> = Result<T, DbError>;

/// Runtime configuration for one replica node.
///
/// # Example
/// ```
/// use common::NodeConfig;
/// use std::path::PathBuf;
/// use std::time::Duration;
///
/// let config = NodeConfig::builder()
///     .data_dir(PathBuf::from("./replica"))
///     .snapshot_threshold(64)
///     .fault_backoff(Duration::from_millis(50))
///     .build();
/// assert_eq!(config.subject(), "logsql.push");
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
pub struct NodeConfig {
    /// Directory holding the database file and node uid.
    #[builder(default = PathBuf::from(DEFAULT_DATA_DIR))]
    pub data_dir: PathBuf,
    /// Application name; names the stream and prefixes the publish subject.
    #[builder(default = DEFAULT_APP.to_string())]
    pub app: String,
    /// Period of the snapshot manager's ticker.
    #[builder(default = Duration::from_secs(2 * 60 * 60))]
    pub snapshot_interval: Duration,
    /// Upper bound of the random delay added before each snapshot cycle.
    #[builder(default = Duration::from_secs(5 * 60))]
    pub snapshot_jitter: Duration,
    /// Minimum applied entries between two snapshots; also the purge safety margin.
    #[builder(default = DEFAULT_SNAPSHOT_THRESHOLD)]
    pub snapshot_threshold: u64,
    /// Minimum age of the previous snapshot before another is produced.
    #[builder(default = Duration::from_secs(30 * 60))]
    pub snapshot_cooldown: Duration,
    /// Delay before the consumer resubscribes after a transport fault.
    #[builder(default = Duration::from_secs(2))]
    pub fault_backoff: Duration,
    /// How long shutdown waits for an in-flight snapshot.
    #[builder(default = Duration::from_secs(30))]
    pub shutdown_grace: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl NodeConfig {
    /// Subject every write batch is published on.
    pub fn subject(&self) -> String {
        format!("{}.push", self.app)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    pub fn uid_path(&self) -> PathBuf {
        self.data_dir.join(UID_FILE)
    }
}

/// Milliseconds since the unix epoch.
pub fn unix_millis() -> u64 {
    unix_millis_of(SystemTime::now())
}

pub fn unix_millis_of(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Elapsed time in fractional milliseconds, as reported in the `time` field of responses.
pub fn elapsed_ms(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}

/// Convenient re-exports for downstream crates.
pub mod prelude {
    pub use crate::{DbError, DbResult, NodeConfig};
    pub use types::{SqlType, Value};
}
