//! Node bootstrap and ordered shutdown.

use crate::consumer::{spawn_consumer, ConsumerHandle};
use crate::context::NodeContext;
use crate::restore::restore_database;
use crate::snapshot_manager::{run_cycle, spawn_snapshot_manager, CycleOutcome, SnapshotManagerHandle};
use blobstore::ObjectStore;
use common::{DbResult, NodeConfig};
use database::StateMachine;
use std::path::Path;
use std::sync::Arc;
use stream::LogService;
use tokio::fs;
use tokio::time::Instant;
use tracing::{info, warn};

/// Read the node's durable identity, creating it on first boot.
pub async fn load_or_create_uid(path: &Path) -> DbResult<String> {
    match fs::read_to_string(path).await {
        Ok(contents) if !contents.trim().is_empty() => return Ok(contents.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let uid = uuid::Uuid::new_v4().to_string();
    fs::write(path, &uid).await?;
    info!(uid = %uid, path = %path.display(), "created node identity");
    Ok(uid)
}

/// A running replica: state machine, consumer and snapshot manager.
pub struct Node {
    ctx: Arc<NodeContext>,
    consumer: ConsumerHandle,
    snapshots: SnapshotManagerHandle,
}

impl Node {
    /// Bootstrap a replica.
    ///
    /// Creates the data directory, loads the node identity, restores the
    /// latest snapshot if no local database exists, opens the state machine,
    /// then starts the consumer at `ledger + 1` and the snapshot manager.
    pub async fn start(
        config: NodeConfig,
        log: Arc<dyn LogService>,
        objects: Arc<dyn ObjectStore>,
    ) -> DbResult<Self> {
        fs::create_dir_all(&config.data_dir).await?;
        let node_id = load_or_create_uid(&config.uid_path()).await?;

        let db_path = config.db_path();
        let restored = restore_database(objects.as_ref(), &db_path).await?;
        let state_machine = Arc::new(StateMachine::open(&db_path).await?);
        let version = state_machine.sqlite_version().await?;
        let ledger = state_machine.sequence().await?;
        info!(
            node = %node_id,
            sqlite = %version,
            ledger,
            restore = ?restored,
            path = %db_path.display(),
            "state machine ready"
        );

        let ctx = Arc::new(NodeContext::new(node_id, config, state_machine, log, objects));
        let consumer = spawn_consumer(ctx.clone());
        let snapshots = spawn_snapshot_manager(ctx.clone(), consumer.clone());

        Ok(Self {
            ctx,
            consumer,
            snapshots,
        })
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn node_id(&self) -> &str {
        &self.ctx.node_id
    }

    pub fn consumer(&self) -> &ConsumerHandle {
        &self.consumer
    }

    /// Run a snapshot cycle outside the periodic schedule.
    pub async fn snapshot_now(&self) -> CycleOutcome {
        run_cycle(&self.ctx, &self.consumer).await
    }

    /// Stop the node.
    ///
    /// The snapshot manager is stopped first and an in-flight cycle, periodic
    /// or on demand, gets up to `shutdown_grace` to finish. Then the consumer
    /// is cancelled and drained, and the database is checkpointed.
    pub async fn shutdown(self) -> DbResult<()> {
        let grace = self.ctx.config.shutdown_grace;
        if self.ctx.in_snapshot() {
            info!(grace_ms = grace.as_millis() as u64, "waiting for in-flight snapshot");
        }
        let deadline = Instant::now() + grace;
        self.snapshots.shutdown(grace).await;
        let _snapshots_done =
            match tokio::time::timeout_at(deadline, self.ctx.lock_snapshots()).await {
                Ok(guard) => Some(guard),
                Err(_) => {
                    warn!("snapshot still running after grace period");
                    None
                }
            };

        let consumer_result = self.consumer.shutdown().await;
        if let Err(e) = &consumer_result {
            warn!(error = %e, "consumer ended with an error");
        }

        self.ctx.state_machine.checkpoint().await?;
        info!(node = %self.ctx.node_id, "node stopped");
        consumer_result
    }
}
