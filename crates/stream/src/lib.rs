//! Ordered, durable log service used as the replication backbone.
//!
//! Replicas never talk to each other. Every write is published to a single
//! per-application stream and every replica reads that stream back in
//! sequence order. This crate defines the contract the replication engine
//! relies on and ships two backends:
//!
//! - [`MemoryStream`]: in-process, cheaply cloneable, shareable between
//!   nodes in one process; supports fault injection for tests.
//! - [`FileStream`]: durable, directory-backed, CRC-checked frames.
//!
//! # Contract
//!
//! - Sequence numbers start at 1 and increase by one per published entry.
//! - A subscription delivers entries with `seq >= start_seq` in order. If the
//!   entries it asked for were purged it resumes at the first retained one.
//! - Acknowledgement is explicit and per entry.
//! - A transport fault makes [`Subscription::next`] fail; the subscription is
//!   then dead and must be recreated.

mod shared;
pub mod file;
pub mod memory;

pub use file::FileStream;
pub use memory::MemoryStream;
pub use protocol::PublishAck;

use async_trait::async_trait;
use bytes::Bytes;
use common::DbResult;
use serde::{Deserialize, Serialize};

/// A record read back from the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub seq: u64,
    pub subject: String,
    pub payload: Bytes,
    /// Publish time in unix milliseconds.
    pub published_ms: u64,
}

/// Point-in-time view of the stream's bounds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// First retained sequence; `last_seq + 1` when the stream is empty.
    pub first_seq: u64,
    /// Highest sequence ever assigned; `0` before the first publish.
    pub last_seq: u64,
    /// Number of retained entries.
    pub messages: u64,
}

/// The log service.
#[async_trait]
pub trait LogService: Send + Sync {
    /// Stream name, reported in publish acknowledgements.
    fn name(&self) -> &str;

    /// Append `payload` on `subject`. Fails with `DbError::Publish`.
    async fn publish(&self, subject: &str, payload: Bytes) -> DbResult<PublishAck>;

    /// Open a subscription for `durable` positioned at `start_seq`.
    async fn subscribe(&self, durable: &str, start_seq: u64) -> DbResult<Box<dyn Subscription>>;

    /// Drop every entry with `seq < before_seq`; returns how many were removed.
    async fn purge(&self, before_seq: u64) -> DbResult<u64>;

    async fn info(&self) -> DbResult<StreamInfo>;
}

/// A live, explicitly acknowledged subscription.
#[async_trait]
pub trait Subscription: Send {
    fn durable_name(&self) -> &str;

    /// Wait for the next entry. Fails with `DbError::Transport` on a fault.
    async fn next(&mut self) -> DbResult<LogEntry>;

    /// Acknowledge a delivered entry.
    async fn ack(&mut self, seq: u64) -> DbResult<()>;

    /// Flush acknowledgements and close the subscription.
    async fn drain(&mut self) -> DbResult<()>;
}
