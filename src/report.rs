use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use serde::Serialize;

use crate::conflict::Conflict;
use crate::engine::ReconcileMode;
use crate::reconcile::Disposition;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedOperation {
    pub path: String,
    pub operation: String,
    pub error: String,
}

/// Everything a pass observed and did.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub root: PathBuf,
    /// The mode the caller asked for.
    pub requested_mode: ReconcileMode,
    /// The mode that actually ran; incremental without a baseline runs as baseline.
    pub mode: ReconcileMode,
    /// Set once the new baseline has been committed.
    pub generation: Option<u64>,
    pub counts: BTreeMap<Disposition, usize>,
    pub conflicts: Vec<Conflict>,
    pub completed: Vec<String>,
    pub failed: Vec<FailedOperation>,
    /// Paths whose state moved during the pass, left for the next one.
    pub deferred: Vec<String>,
    pub elapsed: Duration,
}

impl ReconcileReport {
    pub fn new(root: PathBuf, requested_mode: ReconcileMode, mode: ReconcileMode) -> Self {
        ReconcileReport {
            root,
            requested_mode,
            mode,
            generation: None,
            counts: BTreeMap::new(),
            conflicts: Vec::new(),
            completed: Vec::new(),
            failed: Vec::new(),
            deferred: Vec::new(),
            elapsed: Duration::default(),
        }
    }

    pub fn count(&self, disposition: Disposition) -> usize {
        self.counts.get(&disposition).cloned().unwrap_or(0)
    }

    /// Entries that needed any work at all.
    pub fn changed(&self) -> usize {
        self.counts
            .iter()
            .filter(|&(d, _)| *d != Disposition::Unchanged)
            .map(|(_, n)| n)
            .sum()
    }

    /// One summary line, plus one line per conflict and failure.
    pub fn log_summary(&self) {
        info!("{}", self);
        for conflict in &self.conflicts {
            warn!("Conflict at {:?}: {}", conflict.path, conflict.resolution);
        }
        for failed in &self.failed {
            error!("Failed to {}: {}", failed.operation, failed.error);
        }
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} pass of {:?}", self.mode, self.root)?;
        if let Some(generation) = self.generation {
            write!(f, " committed generation {}", generation)?;
        }
        write!(f, " in {:.2?}:", self.elapsed)?;
        let mut any = false;
        for (disposition, n) in &self.counts {
            if *disposition != Disposition::Unchanged && *n > 0 {
                write!(f, " {} {},", n, disposition)?;
                any = true;
            }
        }
        if !any {
            write!(f, " no changes,")?;
        }
        write!(
            f,
            " {} conflicts, {} operations completed, {} failed, {} deferred",
            self.conflicts.len(),
            self.completed.len(),
            self.failed.len(),
            self.deferred.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lists_changes() {
        let mut report = ReconcileReport::new(PathBuf::from("/home"), ReconcileMode::Incremental, ReconcileMode::Incremental);
        report.counts.insert(Disposition::Unchanged, 10);
        report.counts.insert(Disposition::AddedLocal, 1);
        report.generation = Some(4);

        let line = report.to_string();
        assert!(line.contains("1 added-local"));
        assert!(line.contains("generation 4"));
        assert!(!line.contains("unchanged"));
        assert_eq!(report.changed(), 1);
    }
}
