//! Periodic snapshot and log compaction.
//!
//! Each cycle:
//!
//! 1. marks the node as snapshotting and pauses the consumer
//! 2. vacuums the database
//! 3. checks the gate against the existing snapshot record
//! 4. uploads the database and purges log entries below `ledger - threshold`
//! 5. clears the flag and resumes the consumer
//!
//! A failing step ends the cycle early; the consumer is always resumed.

use crate::consumer::ConsumerHandle;
use crate::context::NodeContext;
use crate::snapshot::{latest_snapshot, upload_snapshot};
use blobstore::ObjectMeta;
use common::{unix_millis, DbResult};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Whether a snapshot should be produced now.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    /// Fewer than `threshold` entries applied since the last snapshot.
    TooFewEntries { applied_since: u64 },
    /// The last snapshot is younger than the cooldown.
    Cooldown { age: Duration },
    /// No snapshot exists yet and the ledger is still below the threshold.
    BelowThreshold { ledger: u64 },
}

/// Decide whether to snapshot at `ledger`, given the existing record.
pub fn snapshot_gate(
    ledger: u64,
    threshold: u64,
    cooldown: Duration,
    last: Option<&ObjectMeta>,
    now_ms: u64,
) -> GateDecision {
    let Some(last) = last else {
        if ledger < threshold {
            return GateDecision::BelowThreshold { ledger };
        }
        return GateDecision::Proceed;
    };

    let applied_since = ledger.saturating_sub(last.sequence);
    if applied_since < threshold {
        return GateDecision::TooFewEntries { applied_since };
    }

    let age = Duration::from_millis(now_ms.saturating_sub(last.modified_ms));
    if age < cooldown {
        return GateDecision::Cooldown { age };
    }
    GateDecision::Proceed
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed { sequence: u64, size: u64, purged: u64 },
    Skipped(GateDecision),
    Failed(String),
}

/// Run one snapshot cycle now. Cycles never overlap; a second caller waits
/// for the first to finish.
pub async fn run_cycle(ctx: &NodeContext, consumer: &ConsumerHandle) -> CycleOutcome {
    let _cycle = ctx.lock_snapshots().await;
    ctx.set_in_snapshot(true);
    let outcome = match consumer.pause().await {
        Ok(()) => {
            let outcome = match snapshot_while_paused(ctx).await {
                Ok(outcome) => outcome,
                Err(e) => CycleOutcome::Failed(e.to_string()),
            };
            ctx.set_in_snapshot(false);
            if let Err(e) = consumer.resume().await {
                warn!(error = %e, "failed to resume consumer after snapshot");
            }
            outcome
        }
        Err(e) => {
            ctx.set_in_snapshot(false);
            CycleOutcome::Failed(format!("pause consumer: {e}"))
        }
    };

    match &outcome {
        CycleOutcome::Completed { sequence, size, purged } => {
            info!(sequence, size, purged, "snapshot cycle completed")
        }
        CycleOutcome::Skipped(reason) => debug!(?reason, "snapshot cycle skipped"),
        CycleOutcome::Failed(error) => warn!(%error, "snapshot cycle failed"),
    }
    outcome
}

async fn snapshot_while_paused(ctx: &NodeContext) -> DbResult<CycleOutcome> {
    ctx.state_machine.vacuum().await?;

    let ledger = ctx.state_machine.sequence().await?;
    let threshold = ctx.config.snapshot_threshold;
    let existing = latest_snapshot(ctx.objects.as_ref()).await?;
    let decision = snapshot_gate(
        ledger,
        threshold,
        ctx.config.snapshot_cooldown,
        existing.as_ref().map(|info| &info.meta),
        unix_millis(),
    );
    if decision != GateDecision::Proceed {
        return Ok(CycleOutcome::Skipped(decision));
    }

    let uploaded = upload_snapshot(ctx).await?;
    let purge_before = ledger.saturating_sub(threshold);
    let purged = if purge_before > 0 {
        ctx.log.purge(purge_before).await?
    } else {
        0
    };
    Ok(CycleOutcome::Completed {
        sequence: uploaded.meta.sequence,
        size: uploaded.size,
        purged,
    })
}

fn jitter_delay(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Handle for the background snapshot loop.
pub struct SnapshotManagerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SnapshotManagerHandle {
    /// Stop the loop, letting an in-flight cycle finish within `grace`.
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();
        let abort = self.task.abort_handle();
        if tokio::time::timeout(grace, self.task).await.is_err() {
            warn!(grace_ms = grace.as_millis() as u64, "snapshot still running after grace period; aborting");
            abort.abort();
        }
    }
}

/// Start the periodic snapshot loop for `ctx`.
pub fn spawn_snapshot_manager(ctx: Arc<NodeContext>, consumer: ConsumerHandle) -> SnapshotManagerHandle {
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run_snapshot_loop(ctx, consumer, cancel.clone()));
    SnapshotManagerHandle { cancel, task }
}

async fn run_snapshot_loop(ctx: Arc<NodeContext>, consumer: ConsumerHandle, cancel: CancellationToken) {
    let period = ctx.config.snapshot_interval;
    if period.is_zero() {
        info!("snapshot manager disabled");
        cancel.cancelled().await;
        return;
    }
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    info!(
        interval_secs = period.as_secs(),
        threshold = ctx.config.snapshot_threshold,
        "snapshot manager started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let delay = jitter_delay(ctx.config.snapshot_jitter);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        run_cycle(&ctx, &consumer).await;
    }

    info!("snapshot manager stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(30 * 60);
    const NOW: u64 = 10_000_000_000;

    fn record(sequence: u64, modified_ms: u64) -> ObjectMeta {
        ObjectMeta {
            sequence,
            modified_ms,
            node_id: "n".into(),
        }
    }

    #[test]
    fn proceeds_when_enough_entries_since_last_snapshot() {
        let last = record(500, 0);
        assert_eq!(
            snapshot_gate(2000, 1024, COOLDOWN, Some(&last), NOW),
            GateDecision::Proceed
        );
    }

    #[test]
    fn skips_when_too_few_entries_since_last_snapshot() {
        let last = record(500, 0);
        assert_eq!(
            snapshot_gate(1200, 1024, COOLDOWN, Some(&last), NOW),
            GateDecision::TooFewEntries { applied_since: 700 }
        );
    }

    #[test]
    fn skips_recent_snapshot_during_cooldown() {
        let last = record(500, NOW - 60_000);
        assert_eq!(
            snapshot_gate(2000, 1024, COOLDOWN, Some(&last), NOW),
            GateDecision::Cooldown { age: Duration::from_secs(60) }
        );
    }

    #[test]
    fn first_snapshot_waits_for_threshold() {
        assert_eq!(
            snapshot_gate(100, 1024, COOLDOWN, None, NOW),
            GateDecision::BelowThreshold { ledger: 100 }
        );
        assert_eq!(snapshot_gate(1024, 1024, COOLDOWN, None, NOW), GateDecision::Proceed);
    }

    #[test]
    fn record_ahead_of_local_ledger_is_skipped() {
        let last = record(5000, 0);
        assert_eq!(
            snapshot_gate(2000, 1024, COOLDOWN, Some(&last), NOW),
            GateDecision::TooFewEntries { applied_since: 0 }
        );
    }

    #[test]
    fn jitter_stays_within_bound() {
        assert_eq!(jitter_delay(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            assert!(jitter_delay(Duration::from_millis(50)) <= Duration::from_millis(50));
        }
    }
}
