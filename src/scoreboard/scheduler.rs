use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::diff::{DiffEngine, DiffOutcome};
use super::error::ScoreboardError;
use super::provider::SourceFetcher;
use crate::db::models::{PollTarget, TargetKey};
use crate::db::SnapshotStore;
use crate::notify::NotificationSink;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    /// Targets polled concurrently within one cycle
    pub workers: usize,
    /// Upper bound on one target's fetch + diff + delivery
    pub target_timeout: Duration,
    /// Applied to targets that do not name a participant themselves
    pub default_tracked_name: Option<String>,
}

/// What happened to one target during a cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TargetOutcome {
    NotTracked,
    Unchanged,
    Changed { changes: usize },
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub target: TargetKey,
    pub outcome: TargetOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub targets: Vec<TargetReport>,
}

impl CycleReport {
    fn count(&self, pred: impl Fn(&TargetOutcome) -> bool) -> usize {
        self.targets.iter().filter(|r| pred(&r.outcome)).count()
    }
}

/// Runs the fetch → diff → notify pipeline for every configured target.
pub struct PollScheduler {
    store: Arc<dyn SnapshotStore>,
    fetcher: SourceFetcher,
    diff: DiffEngine,
    sink: Arc<dyn NotificationSink>,
    config: SchedulerConfig,
    /// Held for the whole cycle so cycles never overlap
    cycle_guard: Mutex<()>,
}

impl PollScheduler {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        fetcher: SourceFetcher,
        diff: DiffEngine,
        sink: Arc<dyn NotificationSink>,
        config: SchedulerConfig,
    ) -> Self {
        PollScheduler {
            store,
            fetcher,
            diff,
            sink,
            config,
            cycle_guard: Mutex::new(()),
        }
    }

    /// Poll every target once. Waits if another cycle is in flight.
    ///
    /// Only failing to load the target list fails the cycle; per-target
    /// errors are reported in the returned [`CycleReport`].
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let _guard = self.cycle_guard.lock().await;
        let started_at = Utc::now();

        let mut seen = HashSet::new();
        let targets: Vec<PollTarget> = self
            .store
            .list_targets()
            .context("Failed to load poll targets")?
            .into_iter()
            .filter(|t| seen.insert(t.key()))
            .collect();

        let mut reports: Vec<TargetReport> = stream::iter(targets)
            .map(|t| self.poll_target(t, started_at))
            .buffer_unordered(self.config.workers.max(1))
            .collect()
            .await;
        reports.sort_by_key(|r| (r.target.owner_id, r.target.target_id));

        let report = CycleReport {
            started_at,
            finished_at: Utc::now(),
            targets: reports,
        };
        info!(
            "Poll cycle done: {} target(s), {} changed, {} failed, {} skipped",
            report.targets.len(),
            report.count(|o| matches!(o, TargetOutcome::Changed { .. })),
            report.count(|o| matches!(o, TargetOutcome::Failed { .. })),
            report.count(|o| matches!(o, TargetOutcome::Skipped { .. })),
        );
        Ok(report)
    }

    async fn poll_target(&self, target: PollTarget, now: DateTime<Utc>) -> TargetReport {
        let key = target.key();

        let outcome = if target.has_ended(now) {
            debug!("[{}] Competition ended, not polling", key);
            TargetOutcome::Skipped {
                reason: "competition ended".into(),
            }
        } else if let Err(e) = self.fetcher.source_for(&target) {
            warn!("[{}] Skipping target: {}", key, e);
            TargetOutcome::Skipped {
                reason: e.to_string(),
            }
        } else {
            let timeout = self.config.target_timeout;
            match tokio::time::timeout(timeout, self.process_target(&target)).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    warn!("[{}] Poll failed: {}", key, e);
                    TargetOutcome::Failed {
                        error: e.to_string(),
                    }
                }
                Err(_) => {
                    let e = ScoreboardError::Timeout(timeout);
                    warn!("[{}] Poll failed: {}", key, e);
                    TargetOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            }
        };

        TargetReport {
            target: key,
            outcome,
        }
    }

    async fn process_target(&self, target: &PollTarget) -> Result<TargetOutcome, ScoreboardError> {
        let key = target.key();
        let entries = self.fetcher.fetch(target).await?;
        debug!("[{}] Fetched {} entries", key, entries.len());

        let tracked = target
            .tracked_name
            .as_deref()
            .or(self.config.default_tracked_name.as_deref())
            .filter(|name| !name.trim().is_empty());

        let outcome = match self
            .diff
            .apply(self.store.as_ref(), target, entries, tracked, Utc::now())?
        {
            DiffOutcome::NotTracked => TargetOutcome::NotTracked,
            DiffOutcome::Unchanged => TargetOutcome::Unchanged,
            DiffOutcome::Changed(event) => {
                info!("[{}] Scoreboard changed ({} change line(s))", key, event.changes.len());
                if let Err(e) = self.sink.on_delta(&event).await {
                    error!("[{}] Delta delivery failed: {:#}", key, e);
                }
                TargetOutcome::Changed {
                    changes: event.changes.len(),
                }
            }
        };
        Ok(outcome)
    }
}

/// Spawns the periodic polling task. The first cycle starts immediately.
///
/// Cancelling `shutdown` stops new cycles from being scheduled; a cycle that
/// is already running is allowed to finish.
pub fn start_poll_loop(scheduler: Arc<PollScheduler>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = scheduler.config.interval;
        info!(
            "Poll loop started (interval={:?}, workers={})",
            period, scheduler.config.workers
        );

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Err(e) = scheduler.run_cycle().await {
                error!("Poll cycle failed: {:#}", e);
            }
        }

        info!("Poll loop stopped");
    })
}
