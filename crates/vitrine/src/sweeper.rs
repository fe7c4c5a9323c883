//! Periodic reconciliation of sessions, containers and routes.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::jobs::{JobQueue, SweepScope};
use crate::session::{DemoResult, DemoSessionOrchestrator, timestamp};

/// Sweeper settings.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Time between scheduled passes.
    pub interval: Duration,
    /// Sessions idle longer than this are terminated.
    pub inactivity_timeout: Duration,
    /// Running sessions idle longer than this are frozen.
    pub freeze_after: Option<Duration>,
    /// Finished sessions are deleted this long after they ended.
    pub retention: Duration,
    /// Orphan containers are collected every this many passes.
    pub orphan_every: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            inactivity_timeout: Duration::from_secs(30 * 60),
            freeze_after: None,
            retention: Duration::from_secs(7 * 24 * 3600),
            orphan_every: 5,
        }
    }
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub started_at: String,
    /// Sessions a previous process left mid-operation.
    pub recovered: usize,
    pub terminated: usize,
    pub frozen: usize,
    /// Candidates that were busy or refreshed in the meantime.
    pub skipped: usize,
    pub failed: usize,
    pub orphans_removed: usize,
    pub routes_published: usize,
    pub routes_withdrawn: usize,
    pub purged: u64,
}

/// Drives the coordinator's reconciliation primitives.
pub struct ReconciliationSweeper {
    demo: DemoSessionOrchestrator,
    config: SweeperConfig,
    passes: AtomicU64,
    running: Mutex<()>,
}

fn before(now: DateTime<Utc>, age: Duration) -> String {
    let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
    timestamp(now.checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC))
}

impl ReconciliationSweeper {
    pub fn new(demo: DemoSessionOrchestrator, config: SweeperConfig) -> Self {
        Self {
            demo,
            config,
            passes: AtomicU64::new(0),
            running: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    pub async fn sweep_sessions(&self, scope: SweepScope) -> DemoResult<SweepReport> {
        self.sweep_sessions_at(Utc::now(), scope).await
    }

    /// One pass as if the current time were `now`.
    ///
    /// Passes never overlap; a second caller waits for the first to finish.
    pub async fn sweep_sessions_at(&self, now: DateTime<Utc>, scope: SweepScope) -> DemoResult<SweepReport> {
        let _running = self.running.lock().await;
        let pass = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
        let mut report = SweepReport {
            started_at: timestamp(now),
            ..Default::default()
        };

        if scope == SweepScope::Startup {
            for session in self.demo.interrupted_sessions().await? {
                match self.demo.recover_interrupted(&session.id).await {
                    Ok(true) => report.recovered += 1,
                    Ok(false) => report.skipped += 1,
                    Err(e) => {
                        warn!("Sweeper could not recover session {}: {}", session.id, e);
                        report.failed += 1;
                    }
                }
            }
        }

        let idle_cutoff = before(now, self.config.inactivity_timeout);
        for session in self.demo.idle_candidates(&idle_cutoff).await? {
            match self.demo.terminate_if_idle(&session.id, &idle_cutoff).await {
                Ok(true) => report.terminated += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!("Sweeper could not terminate session {}: {}", session.id, e);
                    report.failed += 1;
                }
            }
        }

        if let Some(freeze_after) = self.config.freeze_after {
            let freeze_cutoff = before(now, freeze_after);
            for session in self.demo.freeze_candidates(&freeze_cutoff).await? {
                match self.demo.freeze_if_idle(&session.id, &freeze_cutoff).await {
                    Ok(true) => report.frozen += 1,
                    Ok(false) => report.skipped += 1,
                    Err(e) => {
                        warn!("Sweeper could not freeze session {}: {}", session.id, e);
                        report.failed += 1;
                    }
                }
            }
        }

        match self.demo.reconcile_routes().await {
            Ok(routes) => {
                report.routes_published = routes.published;
                report.routes_withdrawn = routes.withdrawn;
            }
            Err(e) => warn!("Route reconciliation failed: {}", e),
        }

        let orphan_every = self.config.orphan_every.max(1);
        if scope != SweepScope::Scheduled || pass % orphan_every == 0 {
            match self.demo.cleanup_orphan_containers().await {
                Ok(removed) => report.orphans_removed = removed,
                Err(e) => warn!("Orphan container cleanup failed: {}", e),
            }
        }

        match self
            .demo
            .purge_expired(&before(now, self.config.retention))
            .await
        {
            Ok(purged) => report.purged = purged,
            Err(e) => warn!("Purge of finished sessions failed: {}", e),
        }
        self.demo.broadcaster().prune();

        if report.recovered + report.terminated + report.frozen + report.orphans_removed + report.failed
            > 0
        {
            info!(
                "Sweep #{}: recovered {}, terminated {}, frozen {}, orphans {}, failed {}",
                pass,
                report.recovered,
                report.terminated,
                report.frozen,
                report.orphans_removed,
                report.failed
            );
        } else {
            debug!("Sweep #{}: nothing to do", pass);
        }

        Ok(report)
    }

    /// Submit a scheduled sweep job every interval until cancelled.
    pub fn spawn_timer(&self, queue: JobQueue, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.config.interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; startup already swept.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if !queue.try_submit_sweep(SweepScope::Scheduled) {
                            debug!("Sweep still queued, skipping this tick");
                        }
                    }
                }
            }
            debug!("Sweep timer stopped");
        })
    }
}
