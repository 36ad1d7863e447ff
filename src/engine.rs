//! The reconciliation entry point: observe, classify, plan, apply, commit.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::archive::{Archive, BaselineEntry, BaselineSnapshot};
use crate::config::SyncConfig;
use crate::conflict::ConflictPolicy;
use crate::detect::{check_root_exists, is_item_in_sync, observe};
use crate::error::SyncError;
use crate::projection::Projection;
use crate::propagate::{build_plan, EmptyProgressCallback, OpOutcome, ProgressCallback, Propagator};
use crate::reconcile::{after_comparison, classify, Verdict};
use crate::report::{FailedOperation, ReconcileReport};
use crate::storage::{Storage, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileMode {
    /// Copy one-sided entries both ways and record the result. Never deletes.
    Baseline,
    /// Three-way diff against the last baseline.
    Incremental,
}

impl ReconcileMode {
    pub fn as_str(&self) -> &'static str {
        match *self {
            ReconcileMode::Baseline => "baseline",
            ReconcileMode::Incremental => "incremental",
        }
    }
}

impl fmt::Display for ReconcileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReconcileMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "baseline" | "resync" => Ok(ReconcileMode::Baseline),
            "incremental" => Ok(ReconcileMode::Incremental),
            _ => Err(format!("invalid mode: {} (expected baseline or incremental)", s)),
        }
    }
}

/// Reconciles local roots against one remote namespace.
pub struct Reconciler {
    storage: Storage,
    archive: Archive,
    config: SyncConfig,
    projection: Option<Projection>,
    progress: Arc<dyn ProgressCallback>,
}

impl Reconciler {
    pub fn new(storage: Storage, archive: Archive, config: SyncConfig) -> Self {
        Reconciler {
            storage,
            archive,
            config,
            projection: None,
            progress: Arc::new(EmptyProgressCallback),
        }
    }

    /// Passes refuse to run while `projection` isn't healthy.
    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    pub async fn reconcile(&self, root: &Path, mode: ReconcileMode) -> Result<ReconcileReport, SyncError> {
        self.reconcile_with_cancel(root, mode, &CancellationToken::new()).await
    }

    /// Runs one pass. The baseline is only committed if every operation was
    /// applied (or deferred) and the pass wasn't cancelled.
    pub async fn reconcile_with_cancel(
        &self,
        root: &Path,
        mode: ReconcileMode,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport, SyncError> {
        let timer = Instant::now();
        let started = Utc::now();

        if let Some(ref projection) = self.projection {
            projection.ensure_ready()?;
        }
        check_root_exists(root)?;
        let _lock = self.archive.lock(root)?;

        let previous = self.archive.load(root)?;
        let effective = match (mode, previous.as_ref()) {
            (ReconcileMode::Incremental, None) => {
                warn!("No baseline recorded for {:?}; running a baseline pass instead", root);
                ReconcileMode::Baseline
            }
            (mode, _) => mode,
        };
        info!("Starting {} pass of {:?} against {}", effective, root, self.storage.describe());
        let mut report = ReconcileReport::new(root.to_path_buf(), mode, effective);

        let observation = observe(root, &*self.storage, &self.config).await?;

        let baseline: Option<&BTreeMap<String, BaselineEntry>> = match effective {
            ReconcileMode::Incremental => previous.as_ref().map(|snapshot| &snapshot.entries),
            ReconcileMode::Baseline => None,
        };
        let policy = match effective {
            ReconcileMode::Incremental => self.config.conflict_policy,
            ReconcileMode::Baseline => ConflictPolicy::PreserveBoth,
        };

        // classify every path seen anywhere
        let mut keys: BTreeSet<&String> = observation.local.keys().chain(observation.remote.keys()).collect();
        if let Some(entries) = baseline {
            keys.extend(entries.keys());
        }

        let mut dispositions = BTreeMap::new();
        let mut to_compare = Vec::new();
        for key in keys {
            let verdict = classify(
                observation.local.get(key),
                observation.remote.get(key),
                baseline.and_then(|entries| entries.get(key)),
            );
            match verdict {
                Verdict::Settled(disposition) => {
                    trace!("{:?} is {}", key, disposition);
                    dispositions.insert(key.clone(), disposition);
                }
                Verdict::Converged => trace!("{:?} is gone from both sides", key),
                Verdict::NeedsComparison => to_compare.push(key.clone()),
            }
        }

        debug!("Comparing contents of {} entries", to_compare.len());
        let storage = &*self.storage;
        let config = &self.config;
        let observation_ref = &observation;
        let compared: Vec<(String, Result<bool, StorageError>)> = stream::iter(to_compare)
            .map(|key| async move {
                let result = match (observation_ref.local.get(&key), observation_ref.remote.get(&key)) {
                    (Some(local), Some(remote)) => {
                        let changed_since_baseline = baseline.map_or(false, |entries| entries.contains_key(&key));
                        is_item_in_sync(root, &key, local, remote, changed_since_baseline, storage, config).await
                    }
                    _ => Ok(false),
                };
                (key, result)
            })
            .buffer_unordered(self.config.parallelism.max(1))
            .collect()
            .await;

        let mut unresolved = BTreeSet::new();
        for (key, result) in compared {
            match result {
                Ok(in_sync) => {
                    dispositions.insert(key, after_comparison(in_sync));
                }
                Err(e) if vanished(&e) => {
                    debug!("{:?} vanished while being compared", key);
                    report.deferred.push(key.clone());
                    unresolved.insert(key);
                }
                Err(e) => {
                    error!("Failed to compare {:?}: {}", key, e);
                    report.failed.push(FailedOperation {
                        path: key.clone(),
                        operation: format!("compare {}", key),
                        error: e.to_string(),
                    });
                    unresolved.insert(key);
                }
            }
        }

        let plan = build_plan(&observation, baseline, dispositions, &unresolved, policy, started);
        info!(
            "Planned {} operations for {:?} ({} conflicts)",
            plan.operations.len(),
            root,
            plan.conflicts.len()
        );
        report.counts = plan.counts;
        report.conflicts = plan.conflicts;
        report.deferred.extend(plan.deferred.iter().cloned());

        let propagator = Propagator {
            root,
            storage: &*self.storage,
            config: &self.config,
            progress: &*self.progress,
            cancel,
            prior_failures: report.failed.len(),
        };
        let results = propagator.execute(plan.operations).await;

        // build the next baseline
        let mut entries = plan.settled;
        let carry_forward = |entries: &mut BTreeMap<String, BaselineEntry>, path: &str| {
            if let Some(previous) = baseline.and_then(|b| b.get(path)) {
                entries.insert(path.to_owned(), previous.clone());
            }
        };
        for path in unresolved.iter().chain(plan.deferred.iter()) {
            carry_forward(&mut entries, path);
        }
        for (op, outcome) in results {
            match outcome {
                OpOutcome::Applied(entry) => {
                    if let Some((path, entry)) = entry {
                        entries.insert(path, entry);
                    }
                    report.completed.push(op.to_string());
                }
                OpOutcome::Stale(_) => {
                    report.deferred.push(op.path().to_owned());
                    carry_forward(&mut entries, op.path());
                }
                OpOutcome::Failed(error) => {
                    report.failed.push(FailedOperation {
                        path: op.path().to_owned(),
                        operation: op.to_string(),
                        error,
                    });
                    carry_forward(&mut entries, op.path());
                }
                OpOutcome::Skipped => carry_forward(&mut entries, op.path()),
            }
        }

        report.elapsed = timer.elapsed();
        if cancel.is_cancelled() {
            warn!("Pass of {:?} cancelled; baseline left untouched", root);
            report.log_summary();
            return Err(SyncError::Cancelled(Box::new(report)));
        }
        if !report.failed.is_empty() {
            report.log_summary();
            return Err(SyncError::Incomplete(Box::new(report)));
        }

        let generation = previous.as_ref().map_or(1, |snapshot| snapshot.generation + 1);
        let snapshot = BaselineSnapshot {
            root: root.to_path_buf(),
            generation,
            reconciled_at: started,
            entries,
        };
        self.archive.commit(&snapshot)?;
        report.generation = Some(generation);
        report.log_summary();
        Ok(report)
    }
}

fn vanished(error: &StorageError) -> bool {
    match *error {
        StorageError::NotFound(_) => true,
        StorageError::Io(ref e) => e.kind() == io::ErrorKind::NotFound,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_parse() {
        assert_eq!("baseline".parse::<ReconcileMode>(), Ok(ReconcileMode::Baseline));
        assert_eq!("Incremental".parse::<ReconcileMode>(), Ok(ReconcileMode::Incremental));
        assert!("bisync".parse::<ReconcileMode>().is_err());
        assert_eq!(ReconcileMode::Incremental.to_string(), "incremental");
    }
}
