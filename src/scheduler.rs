//! Periodic incremental passes over one root.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::engine::{ReconcileMode, Reconciler};
use crate::error::SyncError;
use crate::report::ReconcileReport;

/// Requests an extra pass. Requests made while one is pending collapse into it.
#[derive(Clone)]
pub struct TriggerHandle {
    notify: Arc<Notify>,
}

impl TriggerHandle {
    pub fn trigger(&self) {
        self.notify.notify_one();
    }
}

pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    root: PathBuf,
    interval: Duration,
    cancel: CancellationToken,
    trigger: Arc<Notify>,
    executions: u64,
}

impl Scheduler {
    pub fn new(reconciler: Arc<Reconciler>, root: PathBuf, interval: Duration, cancel: CancellationToken) -> Self {
        Scheduler {
            reconciler,
            root,
            interval,
            cancel,
            trigger: Arc::new(Notify::new()),
            executions: 0,
        }
    }

    pub fn trigger_handle(&self) -> TriggerHandle {
        TriggerHandle {
            notify: self.trigger.clone(),
        }
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    /// The baseline pass run before the service accepts sessions.
    pub async fn initial_pass(&mut self) -> Result<ReconcileReport, SyncError> {
        info!("Running initial baseline pass of {:?}", self.root);
        self.pass(ReconcileMode::Baseline).await
    }

    async fn pass(&mut self, mode: ReconcileMode) -> Result<ReconcileReport, SyncError> {
        self.executions += 1;
        debug!("Execution #{} ({}) of {:?}", self.executions, mode, self.root);
        self.reconciler.reconcile_with_cancel(&self.root, mode, &self.cancel).await
    }

    fn log_next(&self) {
        match chrono::Duration::from_std(self.interval) {
            Ok(interval) => info!(
                "Next pass of {:?} at {} (every {})",
                self.root,
                (Utc::now() + interval).format("%Y-%m-%d %H:%M:%S UTC"),
                humantime::format_duration(self.interval)
            ),
            Err(_) => info!("Next pass of {:?} in {}", self.root, humantime::format_duration(self.interval)),
        }
    }

    /// Runs incremental passes until cancelled.
    ///
    /// Ticks that fall due during a pass are dropped rather than queued.
    /// A failed pass is logged and retried on the next tick; losing the
    /// projection ends the loop with an error.
    pub async fn run(&mut self) -> Result<(), SyncError> {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let cancel = self.cancel.clone();
        let trigger = self.trigger.clone();

        self.log_next();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = trigger.notified() => debug!("Pass of {:?} requested", self.root),
            }

            match self.pass(ReconcileMode::Incremental).await {
                Ok(report) => info!("Execution #{} finished: {} entries changed", self.executions, report.changed()),
                Err(SyncError::Mount(e)) => {
                    error!("Stopping passes of {:?}: {}", self.root, e);
                    return Err(SyncError::Mount(e));
                }
                Err(SyncError::Cancelled(_)) => break,
                Err(SyncError::PassInProgress(_)) => warn!("Skipping pass of {:?}: another is still running", self.root),
                Err(e) => error!("Execution #{} of {:?} failed: {}", self.executions, self.root, e),
            }
            self.log_next();
        }

        info!("Stopped passes of {:?} after {} executions", self.root, self.executions);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use crate::archive::Archive;
    use crate::config::SyncConfig;
    use crate::storage::{ObjectStoreClient, StorageClient};

    #[tokio::test]
    async fn trigger_runs_a_pass() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("home");
        fs::create_dir_all(&root).unwrap();
        let storage = Arc::new(ObjectStoreClient::in_memory());
        let archive = Archive::new(dir.path().join("state")).unwrap();
        let reconciler = Arc::new(Reconciler::new(storage.clone(), archive, SyncConfig::default()));
        let cancel = CancellationToken::new();

        let mut scheduler = Scheduler::new(reconciler, root.clone(), Duration::from_secs(3600), cancel.clone());
        scheduler.initial_pass().await.unwrap();
        let trigger = scheduler.trigger_handle();

        fs::write(root.join("late.txt"), b"late").unwrap();
        let task = tokio::spawn(async move {
            scheduler.run().await.map(|_| scheduler.executions())
        });
        trigger.trigger();
        trigger.trigger();

        let mut uploaded = false;
        for _ in 0..100 {
            if storage.stat("late.txt").await.unwrap().is_some() {
                uploaded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        cancel.cancel();
        let executions = task.await.unwrap().unwrap();

        assert!(uploaded);
        assert!(executions >= 2);
    }

    #[tokio::test]
    async fn cancelled_scheduler_returns() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(ObjectStoreClient::in_memory());
        let archive = Archive::new(dir.path().join("state")).unwrap();
        let reconciler = Arc::new(Reconciler::new(storage, archive, SyncConfig::default()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut scheduler = Scheduler::new(reconciler, dir.path().to_path_buf(), Duration::from_secs(60), cancel);
        scheduler.run().await.unwrap();
        assert_eq!(scheduler.executions(), 0);
    }
}
