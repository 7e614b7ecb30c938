//! Per-node state passed explicitly to every task.

use blobstore::ObjectStore;
use bytes::Bytes;
use common::{DbResult, NodeConfig};
use database::{ApplyResult, StateMachine};
use parser::StatementBatch;
use protocol::PublishAck;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stream::LogService;
use tokio::sync::{Mutex, MutexGuard};

/// Everything one replica owns.
pub struct NodeContext {
    /// Durable node identity; also the consumer's durable name.
    pub node_id: String,
    /// Subject every write is published on.
    pub subject: String,
    pub config: NodeConfig,
    pub state_machine: Arc<StateMachine>,
    pub log: Arc<dyn LogService>,
    pub objects: Arc<dyn ObjectStore>,
    in_snapshot: AtomicBool,
    /// Held for the whole of a snapshot cycle.
    snapshot_lock: Mutex<()>,
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node_id", &self.node_id)
            .field("subject", &self.subject)
            .field("stream", &self.log.name())
            .field("in_snapshot", &self.in_snapshot())
            .finish()
    }
}

impl NodeContext {
    pub fn new(
        node_id: impl Into<String>,
        config: NodeConfig,
        state_machine: Arc<StateMachine>,
        log: Arc<dyn LogService>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            subject: config.subject(),
            config,
            state_machine,
            log,
            objects,
            in_snapshot: AtomicBool::new(false),
            snapshot_lock: Mutex::new(()),
        }
    }

    pub fn in_snapshot(&self) -> bool {
        self.in_snapshot.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_snapshot(&self, value: bool) {
        self.in_snapshot.store(value, Ordering::Release);
    }

    /// Wait for any running snapshot cycle and keep new ones out.
    pub async fn lock_snapshots(&self) -> MutexGuard<'_, ()> {
        self.snapshot_lock.lock().await
    }

    /// Write path: publish the batch exactly as received. Nothing is applied locally.
    pub async fn publish(&self, batch: &StatementBatch) -> DbResult<PublishAck> {
        if let Some(err) = batch.validation_error() {
            return Err(err.clone().into());
        }
        let ack = self
            .log
            .publish(&self.subject, Bytes::from(batch.to_payload()))
            .await?;
        tracing::debug!(seq = ack.seq, statements = batch.statement_count(), "published batch");
        Ok(ack)
    }

    /// Read path: apply against the local database without touching the ledger.
    pub async fn query(&self, batch: &StatementBatch) -> DbResult<ApplyResult> {
        self.state_machine.apply(batch).await
    }
}
