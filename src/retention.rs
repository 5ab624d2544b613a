//! Periodic cleanup: old audit rows, and contracts whose soft-delete grace
//! period has run out.

use crate::audit::{AuditStore, PruneReport};
use crate::clock::SharedClock;
use crate::config::RetentionConfig;
use crate::documents::DocumentStore;
use crate::error::Result;
use crate::storage::Storage;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub audit: PruneReport,
    pub contracts_purged: Option<usize>,
    pub files_removed: usize,
    pub errors: Vec<String>,
    /// Another sweep was already running; nothing was done.
    pub skipped: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStatistics {
    pub ready_for_purge: i64,
    pub in_grace_period: i64,
    pub old_activity_logs: i64,
    pub old_contract_versions: i64,
}

pub struct RetentionSweeper {
    store: Storage,
    audit: AuditStore,
    files: Arc<dyn DocumentStore>,
    clock: SharedClock,
    config: RetentionConfig,
    guard: Mutex<()>,
}

impl RetentionSweeper {
    pub fn new(
        store: Storage,
        audit: AuditStore,
        files: Arc<dyn DocumentStore>,
        clock: SharedClock,
        config: RetentionConfig,
    ) -> Self {
        Self {
            store,
            audit,
            files,
            clock,
            config,
            guard: Mutex::new(()),
        }
    }

    fn cutoff(&self, days: i64) -> DateTime<Utc> {
        self.clock.now() - Duration::days(days)
    }

    /// One sweep. The audit prune and the contract purge fail independently;
    /// a sweep that finds another one in progress does nothing.
    pub async fn run_once(&self) -> SweepReport {
        let Ok(_running) = self.guard.try_lock() else {
            debug!("Retention sweep already in progress");
            return SweepReport {
                skipped: true,
                ..SweepReport::default()
            };
        };
        let mut report = SweepReport::default();

        report.audit = self
            .audit
            .prune(
                self.cutoff(self.config.activity_days),
                self.cutoff(self.config.version_days),
                self.config.batch_size,
            )
            .await;
        report.errors.extend(
            report
                .audit
                .errors
                .iter()
                .map(|e| format!("audit cleanup: {e}")),
        );

        match self.purge_deleted_contracts(&mut report.files_removed).await {
            Ok(purged) => report.contracts_purged = Some(purged),
            Err(e) => {
                error!("Soft-deleted contract cleanup failed: {e}");
                report.errors.push(format!("contract purge: {e}"));
            }
        }

        info!(
            activity_deleted = report.audit.activity_deleted.unwrap_or(0),
            versions_deleted = report.audit.versions_deleted.unwrap_or(0),
            contracts_purged = report.contracts_purged.unwrap_or(0),
            files_removed = report.files_removed,
            "Retention sweep finished"
        );
        report
    }

    // One transaction per batch keeps the primary store available between batches.
    async fn purge_deleted_contracts(&self, files_removed: &mut usize) -> Result<usize> {
        let cutoff = self.cutoff(self.config.soft_delete_days);
        let batch_size = self.config.batch_size.max(1);
        let mut purged = 0;
        loop {
            let (count, paths) = self
                .store
                .write(|tx| {
                    let ids = tx.soft_deleted_before(cutoff, batch_size)?;
                    let mut paths = Vec::new();
                    for id in &ids {
                        paths.extend(tx.document_paths(*id)?);
                        tx.hard_delete_contract(*id)?;
                    }
                    Ok((ids.len(), paths))
                })
                .await?;
            purged += count;
            for path in paths {
                match self.files.delete(&path) {
                    Ok(()) => *files_removed += 1,
                    Err(e) => warn!(path = %path, "Failed to delete purged contract file: {e}"),
                }
            }
            if count < batch_size {
                break;
            }
            tokio::task::yield_now().await;
        }
        if purged > 0 {
            info!(purged, "Purged soft-deleted contracts");
        }
        Ok(purged)
    }

    /// What the next sweep would remove, and how many deleted contracts are
    /// still recoverable.
    pub async fn cleanup_statistics(&self) -> Result<CleanupStatistics> {
        let cutoff = self.cutoff(self.config.soft_delete_days);
        let (ready_for_purge, deleted) = self
            .store
            .read(|tx| Ok((tx.count_soft_deleted_before(cutoff)?, tx.deleted_count()?)))
            .await?;
        let old_activity_logs = self
            .audit
            .count_activity_before(self.cutoff(self.config.activity_days))
            .await
            .unwrap_or_else(|e| {
                warn!("Could not count old activity logs: {e}");
                0
            });
        let old_contract_versions = self
            .audit
            .count_versions_before(self.cutoff(self.config.version_days))
            .await
            .unwrap_or_else(|e| {
                warn!("Could not count old contract versions: {e}");
                0
            });
        Ok(CleanupStatistics {
            ready_for_purge,
            in_grace_period: deleted - ready_for_purge,
            old_activity_logs,
            old_contract_versions,
        })
    }

    /// Run a sweep every configured interval until the handle is stopped.
    /// The first sweep happens one interval after spawning.
    pub fn spawn(self: Arc<Self>) -> SweeperHandle {
        let (shutdown, mut stop_rx) = oneshot::channel();
        let period = self.config.interval.max(std::time::Duration::from_secs(1));
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            info!(interval_secs = period.as_secs(), "Retention sweeper started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                    _ = &mut stop_rx => break,
                }
            }
            info!("Retention sweeper stopped");
        });
        SweeperHandle { shutdown, task }
    }
}

pub struct SweeperHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the timer loop. A sweep in progress finishes first.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            warn!("Retention sweeper task ended abnormally: {e}");
        }
    }
}
