//! In-process log service.

use crate::shared::{StreamCore, StreamState};
use crate::{LogService, PublishAck, StreamInfo, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use common::{unix_millis, DbError, DbResult};
use std::sync::Arc;

/// A log held entirely in memory.
///
/// Clones share the same stream, so several nodes in one process can
/// replicate through it. Nothing survives the last clone being dropped.
#[derive(Clone, Debug)]
pub struct MemoryStream {
    core: Arc<StreamCore>,
}

impl MemoryStream {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            core: StreamCore::new(name, StreamState::default()),
        }
    }

    /// Fail every open subscription with a transport error. Publishing keeps working.
    pub fn inject_fault(&self) {
        tracing::debug!(stream = self.core.name(), "injecting subscription fault");
        self.core.fault();
    }

    /// While unavailable, publishes fail and subscriptions cannot be opened.
    pub fn set_unavailable(&self, unavailable: bool) {
        if unavailable {
            self.core.fault();
        }
        self.core.set_unavailable(unavailable);
    }

    /// Last acknowledged sequence of a durable consumer.
    pub fn acked(&self, durable: &str) -> Option<u64> {
        self.core.lock().consumers.get(durable).copied()
    }
}

#[async_trait]
impl LogService for MemoryStream {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> DbResult<PublishAck> {
        self.core.check_available(DbError::Publish)?;
        let entry = self.core.append(subject, payload, unix_millis());
        Ok(PublishAck {
            stream: self.core.name().to_string(),
            seq: entry.seq,
            duplicate: false,
        })
    }

    async fn subscribe(&self, durable: &str, start_seq: u64) -> DbResult<Box<dyn Subscription>> {
        self.core.check_available(DbError::Transport)?;
        Ok(Box::new(self.core.subscribe(durable, start_seq)))
    }

    async fn purge(&self, before_seq: u64) -> DbResult<u64> {
        Ok(self.core.purge(before_seq))
    }

    async fn info(&self) -> DbResult<StreamInfo> {
        self.core.check_available(DbError::Transport)?;
        Ok(self.core.info())
    }
}
