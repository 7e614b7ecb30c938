//! A single replica running in a temporary directory.

use crate::fixtures::{test_config, WAIT_TIMEOUT};
use anyhow::{anyhow, Context, Result};
use blobstore::{MemoryObjectStore, ObjectStore};
use common::NodeConfig;
use database::ApplyResult;
use protocol::PublishAck;
use replication::{CycleOutcome, Node, NodeContext};
use serde_json::Value as Json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use stream::{LogService, MemoryStream};
use tempfile::TempDir;
use types::Value;

/// Wait until `node` has applied `seq`, failing after [`WAIT_TIMEOUT`].
pub async fn wait_for_sequence(node: &Node, seq: u64) -> Result<()> {
    tokio::time::timeout(WAIT_TIMEOUT, node.consumer().wait_for_sequence(seq))
        .await
        .map_err(|_| {
            anyhow!(
                "node {} did not reach seq {seq} (at {})",
                node.node_id(),
                node.consumer().status().applied_seq
            )
        })??;
    Ok(())
}

/// A replica with its own data directory.
///
/// The directory outlives restarts of the node and is removed on drop.
pub struct TestNode {
    dir: TempDir,
    node: Option<Node>,
    log: Arc<dyn LogService>,
    objects: Arc<dyn ObjectStore>,
    configure: fn(&Path) -> NodeConfig,
}

impl TestNode {
    /// Start a node on a fresh in-memory log and object store.
    pub async fn start() -> Result<Self> {
        Self::start_with(
            Arc::new(MemoryStream::new(common::DEFAULT_APP)),
            Arc::new(MemoryObjectStore::new()),
        )
        .await
    }

    /// Start a node attached to the given log and object store.
    pub async fn start_with(log: Arc<dyn LogService>, objects: Arc<dyn ObjectStore>) -> Result<Self> {
        Self::start_configured(log, objects, test_config).await
    }

    pub async fn start_configured(
        log: Arc<dyn LogService>,
        objects: Arc<dyn ObjectStore>,
        configure: fn(&Path) -> NodeConfig,
    ) -> Result<Self> {
        let dir = TempDir::new()?;
        let mut node = Self {
            dir,
            node: None,
            log,
            objects,
            configure,
        };
        node.boot().await?;
        Ok(node)
    }

    async fn boot(&mut self) -> Result<()> {
        let config = (self.configure)(self.dir.path());
        let node = Node::start(config, self.log.clone(), self.objects.clone())
            .await
            .context("starting test node")?;
        self.node = Some(node);
        Ok(())
    }

    pub fn node(&self) -> Result<&Node> {
        self.node.as_ref().ok_or_else(|| anyhow!("node is stopped"))
    }

    pub fn context(&self) -> Result<Arc<NodeContext>> {
        Ok(self.node()?.context().clone())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    pub fn log(&self) -> &Arc<dyn LogService> {
        &self.log
    }

    /// Publish a write through this node's router path.
    pub async fn publish(&self, payload: Json) -> Result<PublishAck> {
        let batch = parser::classify(payload, Instant::now());
        Ok(self.node()?.context().publish(&batch).await?)
    }

    /// Run a read against this node's local database.
    pub async fn query(&self, payload: Json) -> Result<ApplyResult> {
        let batch = parser::classify(payload, Instant::now());
        Ok(self.node()?.context().query(&batch).await?)
    }

    /// Run a single-statement read and return its rows.
    pub async fn rows(&self, sql: &str) -> Result<Vec<Vec<Value>>> {
        match self.query(serde_json::json!([sql])).await? {
            ApplyResult::Rows { rows, .. } => Ok(rows),
            other => Err(anyhow!("expected rows from {sql:?}, got {other:?}")),
        }
    }

    pub async fn sequence(&self) -> Result<u64> {
        Ok(self.node()?.context().state_machine.sequence().await?)
    }

    pub async fn wait_for_sequence(&self, seq: u64) -> Result<()> {
        wait_for_sequence(self.node()?, seq).await
    }

    pub async fn snapshot_now(&self) -> Result<CycleOutcome> {
        Ok(self.node()?.snapshot_now().await)
    }

    /// Shut the node down, keeping its data directory.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(node) = self.node.take() {
            node.shutdown().await?;
        }
        Ok(())
    }

    /// Stop and start again on the same data directory.
    pub async fn restart(&mut self) -> Result<()> {
        self.stop().await?;
        self.boot().await
    }
}
