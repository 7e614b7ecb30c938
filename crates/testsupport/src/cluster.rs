//! Several replicas sharing one log and one object store.

use crate::context::TestNode;
use anyhow::{anyhow, ensure, Result};
use blobstore::MemoryObjectStore;
use serde_json::Value as Json;
use std::sync::Arc;
use stream::MemoryStream;

pub struct TestCluster {
    pub log: MemoryStream,
    pub objects: MemoryObjectStore,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Start `size` replicas on a shared in-memory log.
    pub async fn start(size: usize) -> Result<Self> {
        let mut cluster = Self {
            log: MemoryStream::new(common::DEFAULT_APP),
            objects: MemoryObjectStore::new(),
            nodes: Vec::with_capacity(size),
        };
        for _ in 0..size {
            cluster.add_node().await?;
        }
        Ok(cluster)
    }

    /// Start one more replica; it catches up from the snapshot and the log.
    pub async fn add_node(&mut self) -> Result<&TestNode> {
        let node = TestNode::start_with(
            Arc::new(self.log.clone()),
            Arc::new(self.objects.clone()),
        )
        .await?;
        self.nodes.push(node);
        self.nodes.last().ok_or_else(|| anyhow!("node was not added"))
    }

    pub fn node(&self, index: usize) -> Result<&TestNode> {
        self.nodes
            .get(index)
            .ok_or_else(|| anyhow!("no node at index {index}"))
    }

    /// Publish through the first node; returns the assigned sequence.
    pub async fn publish(&self, payload: Json) -> Result<u64> {
        Ok(self.node(0)?.publish(payload).await?.seq)
    }

    pub async fn wait_all(&self, seq: u64) -> Result<()> {
        for node in &self.nodes {
            node.wait_for_sequence(seq).await?;
        }
        Ok(())
    }

    /// Assert every replica returns the same rows for `sql` and has the same ledger.
    pub async fn assert_converged(&self, sql: &str) -> Result<()> {
        let first = self.node(0)?;
        let expected_rows = first.rows(sql).await?;
        let expected_seq = first.sequence().await?;
        for (index, node) in self.nodes.iter().enumerate().skip(1) {
            let rows = node.rows(sql).await?;
            ensure!(
                rows == expected_rows,
                "node {index} diverged: {rows:?} != {expected_rows:?}"
            );
            let seq = node.sequence().await?;
            ensure!(seq == expected_seq, "node {index} ledger {seq} != {expected_seq}");
        }
        Ok(())
    }

    pub async fn shutdown(mut self) -> Result<()> {
        for node in &mut self.nodes {
            node.stop().await?;
        }
        Ok(())
    }
}
