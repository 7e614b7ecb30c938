//! Test support utilities for the replica workspace.
//!
//! This crate provides in-process testing infrastructure:
//! - [`TestNode`]: a full replica (consumer and snapshot manager) in a temporary directory
//! - [`TestCluster`]: several replicas sharing one in-memory log and object store
//! - [`TestServer`]: a replica behind a real HTTP server on an ephemeral port
//! - fixtures and row assertions for request payloads
//!
//! # Example Usage
//!
//! ```no_run
//! use testsupport::prelude::*;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let cluster = TestCluster::start(2).await?;
//! let seq = cluster.publish(users_schema()).await?;
//! cluster.wait_all(seq).await?;
//! cluster.assert_converged("SELECT * FROM users ORDER BY id").await?;
//! # Ok(())
//! # }
//! ```

pub mod assertions;
pub mod cluster;
pub mod context;
pub mod fixtures;
pub mod server;

pub use cluster::TestCluster;
pub use context::TestNode;
pub use server::TestServer;

/// Convenient re-exports for common testing patterns.
pub mod prelude {
    pub use crate::assertions::*;
    pub use crate::cluster::*;
    pub use crate::context::*;
    pub use crate::fixtures::*;
    pub use crate::server::*;
}
