//! Log-driven replication for a single SQLite replica.
//!
//! Replicas do not talk to each other. Writes are published to an ordered
//! log and every replica applies that log, in order, to its own database.
//!
//! ```text
//!            publish                         subscribe(ledger + 1)
//!  router ───────────────▶  LogService  ─────────────────────────▶  Consumer
//!                               ▲                                      │
//!                               │ purge(ledger - threshold)            │ apply_replicated
//!                               │                                      ▼
//!                        SnapshotManager ── pause/resume ──▶     StateMachine
//!                               │                                      ▲
//!                               ▼ put("snapshot")                      │ restore on first boot
//!                          ObjectStore ────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`context`]: per-node state shared by every task
//! - [`consumer`]: the subscription loop and its control handle
//! - [`snapshot`]: uploading the database to the object store
//! - [`restore`]: seeding a fresh node from the latest snapshot
//! - [`snapshot_manager`]: the periodic snapshot and log compaction cycle
//! - [`node`]: bootstrap and ordered shutdown

pub mod consumer;
pub mod context;
pub mod node;
pub mod restore;
pub mod snapshot;
pub mod snapshot_manager;

pub use consumer::{spawn_consumer, ConsumerHandle, ConsumerState, ConsumerStatus};
pub use context::NodeContext;
pub use node::{load_or_create_uid, Node};
pub use restore::{restore_database, RestoreOutcome};
pub use snapshot::{latest_snapshot, upload_snapshot};
pub use snapshot_manager::{
    run_cycle, snapshot_gate, spawn_snapshot_manager, CycleOutcome, GateDecision,
    SnapshotManagerHandle,
};
