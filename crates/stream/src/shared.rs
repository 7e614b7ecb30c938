//! In-memory stream state shared by both backends.

use crate::{LogEntry, StreamInfo, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use common::{DbError, DbResult};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub(crate) struct StreamState {
    pub entries: BTreeMap<u64, LogEntry>,
    pub last_seq: u64,
    /// Highest acknowledged sequence per durable consumer.
    pub consumers: BTreeMap<String, u64>,
    /// Bumped on every injected fault; subscriptions from older generations fail.
    pub generation: u64,
    pub unavailable: bool,
}

/// Retained entries plus the wakeup used by blocked subscribers.
#[derive(Debug)]
pub(crate) struct StreamCore {
    name: String,
    state: Mutex<StreamState>,
    notify: Notify,
}

impl StreamCore {
    pub fn new(name: impl Into<String>, state: StreamState) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(state),
            notify: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn check_available(&self, make: fn(String) -> DbError) -> DbResult<()> {
        if self.lock().unavailable {
            return Err(make(format!("stream {} unavailable", self.name)));
        }
        Ok(())
    }

    /// Assign the next sequence to `payload` and make it visible to subscribers.
    pub fn append(&self, subject: &str, payload: Bytes, published_ms: u64) -> LogEntry {
        let entry = {
            let mut state = self.lock();
            let entry = LogEntry {
                seq: state.last_seq + 1,
                subject: subject.to_string(),
                payload,
                published_ms,
            };
            state.last_seq = entry.seq;
            state.entries.insert(entry.seq, entry.clone());
            entry
        };
        self.notify.notify_waiters();
        entry
    }

    pub fn next_seq(&self) -> u64 {
        self.lock().last_seq + 1
    }

    /// Insert an entry whose sequence was reserved by the caller and wake subscribers.
    pub fn insert(&self, entry: LogEntry) {
        {
            let mut state = self.lock();
            state.last_seq = state.last_seq.max(entry.seq);
            state.entries.insert(entry.seq, entry);
        }
        self.notify.notify_waiters();
    }

    pub fn purge(&self, before_seq: u64) -> u64 {
        let mut state = self.lock();
        let retained = state.entries.split_off(&before_seq);
        let removed = state.entries.len() as u64;
        state.entries = retained;
        removed
    }

    pub fn info(&self) -> StreamInfo {
        let state = self.lock();
        StreamInfo {
            first_seq: state
                .entries
                .keys()
                .next()
                .copied()
                .unwrap_or(state.last_seq + 1),
            last_seq: state.last_seq,
            messages: state.entries.len() as u64,
        }
    }

    pub fn subscribe(self: &Arc<Self>, durable: &str, start_seq: u64) -> CoreSubscription {
        let generation = {
            let mut state = self.lock();
            let floor = start_seq.saturating_sub(1);
            let acked = state.consumers.entry(durable.to_string()).or_insert(floor);
            *acked = floor;
            state.generation
        };
        CoreSubscription {
            core: self.clone(),
            durable: durable.to_string(),
            next_seq: start_seq.max(1),
            generation,
            closed: false,
        }
    }

    /// Break every live subscription.
    pub fn fault(&self) {
        self.lock().generation += 1;
        self.notify.notify_waiters();
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
        self.notify.notify_waiters();
    }
}

pub(crate) struct CoreSubscription {
    core: Arc<StreamCore>,
    durable: String,
    next_seq: u64,
    generation: u64,
    closed: bool,
}

#[async_trait]
impl Subscription for CoreSubscription {
    fn durable_name(&self) -> &str {
        &self.durable
    }

    async fn next(&mut self) -> DbResult<LogEntry> {
        let core = self.core.clone();
        loop {
            let notified = core.notify.notified();
            if let Some(result) = self.poll_entry() {
                return result;
            }
            notified.await;
        }
    }

    async fn ack(&mut self, seq: u64) -> DbResult<()> {
        if self.closed {
            return Err(DbError::Transport("ack on closed subscription".into()));
        }
        let mut state = self.core.lock();
        let acked = state.consumers.entry(self.durable.clone()).or_insert(0);
        *acked = (*acked).max(seq);
        Ok(())
    }

    async fn drain(&mut self) -> DbResult<()> {
        self.closed = true;
        Ok(())
    }
}

impl CoreSubscription {
    fn poll_entry(&mut self) -> Option<DbResult<LogEntry>> {
        let state = self.core.lock();
        if self.closed {
            return Some(Err(DbError::Transport("subscription closed".into())));
        }
        if state.unavailable || state.generation != self.generation {
            return Some(Err(DbError::Transport(format!(
                "subscription {} dropped",
                self.durable
            ))));
        }
        let entry = state.entries.range(self.next_seq..).next().map(|(_, e)| e.clone())?;
        drop(state);
        self.next_seq = entry.seq + 1;
        Some(Ok(entry))
    }
}
