//! The replication consumer.
//!
//! One task per node reads the log from `ledger + 1`, one entry at a time,
//! and applies each entry through the state machine before acknowledging
//! it.
//!
//! ```text
//! Starting ──▶ CatchingUp ──▶ Live
//!    ▲              │           │
//!    │              ▼           ▼
//!    ├──────── Faulted ◀────────┤   (transport error, after backoff)
//!    │                          │
//!    └──────── Draining ◀───────┘   (pause; back to Starting on resume)
//!
//! any state ──▶ Stopped             (cancelled, or fatal storage error)
//! ```
//!
//! Every subscription is opened fresh from the persisted ledger, so an entry
//! whose effects were committed is never requested again.

use crate::context::NodeContext;
use common::{DbError, DbResult};
use std::sync::Arc;
use std::time::Instant;
use stream::{LogEntry, Subscription};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerState {
    Starting,
    /// Replaying entries published before the subscription was opened.
    CatchingUp,
    Live,
    /// Waiting out the backoff after a transport error.
    Faulted,
    /// Paused with the subscription closed.
    Draining,
    Stopped,
}

/// Snapshot of the consumer, published on every change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConsumerStatus {
    pub state: ConsumerState,
    /// Highest sequence processed by this consumer, or the ledger at start.
    pub applied_seq: u64,
}

enum Control {
    Pause(oneshot::Sender<()>),
    Resume,
}

/// Control handle for a running consumer. Clones share the same task.
#[derive(Clone)]
pub struct ConsumerHandle {
    control: mpsc::Sender<Control>,
    status: watch::Receiver<ConsumerStatus>,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<DbResult<()>>>>>,
}

impl ConsumerHandle {
    pub fn status(&self) -> ConsumerStatus {
        *self.status.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ConsumerStatus> {
        self.status.clone()
    }

    /// Close the subscription. Resolves once the consumer is idle.
    pub async fn pause(&self) -> DbResult<()> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Pause(tx))
            .await
            .map_err(|_| DbError::Transport("consumer is not running".into()))?;
        rx.await
            .map_err(|_| DbError::Transport("consumer stopped while pausing".into()))
    }

    pub async fn resume(&self) -> DbResult<()> {
        self.control
            .send(Control::Resume)
            .await
            .map_err(|_| DbError::Transport("consumer is not running".into()))
    }

    /// Wait until the consumer has processed `seq`.
    pub async fn wait_for_sequence(&self, seq: u64) -> DbResult<ConsumerStatus> {
        let mut status = self.status.clone();
        let reached = status
            .wait_for(|s| s.applied_seq >= seq || s.state == ConsumerState::Stopped)
            .await
            .map_err(|_| DbError::Transport("consumer status closed".into()))?;
        let current = *reached;
        if current.applied_seq >= seq {
            Ok(current)
        } else {
            Err(DbError::Transport(format!(
                "consumer stopped at {} before reaching {seq}",
                current.applied_seq
            )))
        }
    }

    pub async fn wait_for_state(&self, state: ConsumerState) {
        let mut status = self.status.clone();
        let _ = status.wait_for(|s| s.state == state).await;
    }

    /// Resolves when the consumer task has stopped on its own or been cancelled.
    pub async fn stopped(&self) {
        self.wait_for_state(ConsumerState::Stopped).await;
    }

    /// Cancel the consumer, drain its subscription and wait for the task.
    ///
    /// Returns the fatal error that stopped the consumer, if any.
    pub async fn shutdown(&self) -> DbResult<()> {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        match task {
            Some(task) => task
                .await
                .map_err(|e| DbError::Storage(format!("consumer task failed: {e}")))?,
            None => Ok(()),
        }
    }
}

/// Start the consumer for `ctx`, subscribing under the node's durable identity.
pub fn spawn_consumer(ctx: Arc<NodeContext>) -> ConsumerHandle {
    let (control_tx, control_rx) = mpsc::channel(8);
    let (status_tx, status_rx) = watch::channel(ConsumerStatus {
        state: ConsumerState::Starting,
        applied_seq: 0,
    });
    let cancel = CancellationToken::new();

    let consumer = Consumer {
        ctx,
        control: control_rx,
        status: status_tx,
        cancel: cancel.clone(),
        tail: 0,
    };
    let task = tokio::spawn(consumer.run());

    ConsumerHandle {
        control: control_tx,
        status: status_rx,
        cancel,
        task: Arc::new(Mutex::new(Some(task))),
    }
}

/// Why a subscription ended.
enum Exit {
    Cancelled,
    Paused(oneshot::Sender<()>),
    Fault(DbError),
    Fatal(DbError),
}

struct Consumer {
    ctx: Arc<NodeContext>,
    control: mpsc::Receiver<Control>,
    status: watch::Sender<ConsumerStatus>,
    cancel: CancellationToken,
    /// Log tail captured when the current subscription was opened.
    tail: u64,
}

impl Consumer {
    async fn run(mut self) -> DbResult<()> {
        let durable = self.ctx.node_id.clone();
        info!(node = %durable, subject = %self.ctx.subject, "consumer started");

        let result = loop {
            self.set_state(ConsumerState::Starting);
            let exit = match self.start().await {
                Ok(mut sub) => {
                    let exit = self.consume(sub.as_mut()).await;
                    if let Err(e) = sub.drain().await {
                        warn!(error = %e, "failed to drain subscription");
                    }
                    exit
                }
                Err(exit) => exit,
            };

            match exit {
                Exit::Cancelled => break Ok(()),
                Exit::Fatal(err) => {
                    error!(error = %err, "consumer stopped on fatal error");
                    break Err(err);
                }
                Exit::Paused(ack) => {
                    self.set_state(ConsumerState::Draining);
                    debug!("consumer drained");
                    let _ = ack.send(());
                    if !self.wait_resume().await {
                        break Ok(());
                    }
                }
                Exit::Fault(err) => {
                    self.set_state(ConsumerState::Faulted);
                    warn!(
                        error = %err,
                        backoff_ms = self.ctx.config.fault_backoff.as_millis() as u64,
                        "subscription faulted"
                    );
                    if !self.backoff().await {
                        break Ok(());
                    }
                }
            }
        };

        self.set_state(ConsumerState::Stopped);
        info!(node = %durable, "consumer stopped");
        result
    }

    fn set_state(&self, state: ConsumerState) {
        self.status.send_modify(|s| s.state = state);
    }

    fn applied(&self) -> u64 {
        self.status.borrow().applied_seq
    }

    /// Compute the start position from the ledger and open a subscription there.
    async fn start(&mut self) -> Result<Box<dyn Subscription>, Exit> {
        let applied = self.ctx.state_machine.sequence().await.map_err(Exit::Fatal)?;
        let start = applied + 1;
        let tail = self.ctx.log.info().await.map_err(Exit::Fault)?.last_seq;
        let sub = self
            .ctx
            .log
            .subscribe(&self.ctx.node_id, start)
            .await
            .map_err(Exit::Fault)?;

        let state = if tail < start {
            ConsumerState::Live
        } else {
            ConsumerState::CatchingUp
        };
        self.tail = tail;
        self.status.send_modify(|s| {
            s.state = state;
            s.applied_seq = applied;
        });
        info!(start, tail, state = ?state, "subscribed");
        Ok(sub)
    }

    /// Receive and process entries until cancelled, paused or faulted.
    async fn consume(&mut self, sub: &mut dyn Subscription) -> Exit {
        loop {
            let entry = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Exit::Cancelled,
                msg = self.control.recv() => match msg {
                    Some(Control::Pause(ack)) => return Exit::Paused(ack),
                    Some(Control::Resume) => continue,
                    None => return Exit::Cancelled,
                },
                next = sub.next() => match next {
                    Ok(entry) => entry,
                    Err(e) if e.is_fatal() => return Exit::Fatal(e),
                    Err(e) => return Exit::Fault(e),
                },
            };

            if let Err(exit) = self.process(entry, sub).await {
                return exit;
            }
        }
    }

    /// Apply one entry, advance the ledger and acknowledge.
    async fn process(&mut self, entry: LogEntry, sub: &mut dyn Subscription) -> Result<(), Exit> {
        let seq = entry.seq;
        let expected = self.applied() + 1;
        if seq < expected {
            debug!(seq, expected, "skipping already applied entry");
            return sub.ack(seq).await.map_err(Exit::Fault);
        }
        if seq > expected {
            warn!(
                seq,
                expected,
                missing = seq - expected,
                "gap in log; entries were purged before this replica applied them"
            );
        }

        self.apply_entry(&entry).await?;
        sub.ack(seq).await.map_err(Exit::Fault)?;

        let caught_up = self.status.borrow().state == ConsumerState::CatchingUp && seq >= self.tail;
        self.status.send_modify(|s| {
            s.applied_seq = seq;
            if caught_up {
                s.state = ConsumerState::Live;
            }
        });
        if caught_up {
            info!(seq, "caught up");
        }
        Ok(())
    }

    /// Apply the entry's batch with the ledger update. Entries that cannot be
    /// applied still advance the ledger; only storage failures are fatal.
    async fn apply_entry(&self, entry: &LogEntry) -> Result<(), Exit> {
        let seq = entry.seq;
        let state_machine = &self.ctx.state_machine;

        let batch = match parser::classify_bytes(&entry.payload, Instant::now()) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(seq, error = %e, "skipping undecodable entry");
                return state_machine.set_sequence(seq).await.map_err(Exit::Fatal);
            }
        };
        if let Some(err) = batch.validation_error() {
            warn!(seq, error = %err, "skipping invalid entry");
            return state_machine.set_sequence(seq).await.map_err(Exit::Fatal);
        }

        match state_machine.apply_replicated(&batch, seq).await {
            Ok(_) => {
                debug!(seq, statements = batch.statement_count(), "applied entry");
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(Exit::Fatal(e)),
            Err(e) => {
                warn!(seq, error = %e, "entry failed to apply; advancing past it");
                state_machine.set_sequence(seq).await.map_err(Exit::Fatal)
            }
        }
    }

    /// Stay idle until resumed. Returns false when cancelled instead.
    async fn wait_resume(&mut self) -> bool {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                msg = self.control.recv() => match msg {
                    Some(Control::Resume) => {
                        debug!("consumer resumed");
                        return true;
                    }
                    Some(Control::Pause(ack)) => {
                        let _ = ack.send(());
                    }
                    None => return false,
                },
            }
        }
    }

    /// Sleep out the fault backoff. A pause during the backoff is honored.
    async fn backoff(&mut self) -> bool {
        let sleep = tokio::time::sleep(self.ctx.config.fault_backoff);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                msg = self.control.recv() => match msg {
                    Some(Control::Pause(ack)) => {
                        self.set_state(ConsumerState::Draining);
                        let _ = ack.send(());
                        return self.wait_resume().await;
                    }
                    Some(Control::Resume) => {}
                    None => return false,
                },
                _ = &mut sleep => return true,
            }
        }
    }
}
