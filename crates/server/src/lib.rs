//! HTTP surface of a replica.
//!
//! - [`router`]: the axum routes for health checks and queries
//! - [`logging`]: subscriber setup for the binary

pub mod logging;
pub mod router;

pub use router::{ServerHandle, create_router, start_server};
