//! Applies a plan in phases: renames, directories, copies, then deletions.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::archive::BaselineEntry;
use crate::config::SyncConfig;
use crate::storage::{StorageClient, StorageError};
use crate::transfer::{self, TransferContext};
use crate::util::depth;
use crate::Side;

mod plan;
mod progress;

pub use self::plan::{build_plan, Operation, Plan};
pub use self::progress::{EmptyProgressCallback, ProgressCallback};

/// What happened to one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    /// Done. Carries the new baseline entry, if the path still exists.
    Applied(Option<(String, BaselineEntry)>),
    /// State moved under us; left for the next pass.
    Stale(String),
    Failed(String),
    /// Never started because the pass was cancelled or had already failed.
    Skipped,
}

/// Runs operations against both sides of one root.
pub struct Propagator<'a> {
    pub root: &'a Path,
    pub storage: &'a dyn StorageClient,
    pub config: &'a SyncConfig,
    pub progress: &'a dyn ProgressCallback,
    pub cancel: &'a CancellationToken,
    /// Failures recorded before propagation started, e.g. content comparisons.
    pub prior_failures: usize,
}

impl<'a> Propagator<'a> {
    /// Executes `operations` and returns every one of them with its outcome.
    ///
    /// Deletions only run when nothing else failed and the pass wasn't cancelled.
    pub async fn execute(&self, operations: Vec<Operation>) -> Vec<(Operation, OpOutcome)> {
        let abort = self.cancel.child_token();
        let failures = AtomicUsize::new(self.prior_failures);

        let mut renames = Vec::new();
        let mut create_dirs = Vec::new();
        let mut copies = Vec::new();
        let mut delete_files = Vec::new();
        let mut delete_dirs = Vec::new();
        for op in operations {
            match op {
                Operation::PreserveLocal { .. } => renames.push(op),
                Operation::CreateDir { .. } => create_dirs.push(op),
                Operation::Copy { .. } => copies.push(op),
                Operation::Delete { .. } if op.is_directory_op() => delete_dirs.push(op),
                Operation::Delete { .. } => delete_files.push(op),
            }
        }
        // parents before children, and children before parents when removing
        create_dirs.sort_by_key(|op| depth(op.path()));
        delete_dirs.sort_by_key(|op| std::cmp::Reverse(depth(op.path())));

        let mut results = Vec::new();
        for op in renames {
            results.push(self.run(op, &abort, &failures).await);
        }
        for op in create_dirs {
            results.push(self.run(op, &abort, &failures).await);
        }

        let parallelism = self.config.parallelism.max(1);
        let copied: Vec<(Operation, OpOutcome)> = stream::iter(copies)
            .map(|op| self.run(op, &abort, &failures))
            .buffer_unordered(parallelism)
            .collect()
            .await;
        results.extend(copied);

        if failures.load(Ordering::SeqCst) > 0 || abort.is_cancelled() {
            if !delete_files.is_empty() || !delete_dirs.is_empty() {
                warn!("Skipping {} deletions because the pass did not complete", delete_files.len() + delete_dirs.len());
            }
            results.extend(delete_files.into_iter().chain(delete_dirs).map(|op| (op, OpOutcome::Skipped)));
            return results;
        }

        let deleted: Vec<(Operation, OpOutcome)> = stream::iter(delete_files)
            .map(|op| self.run(op, &abort, &failures))
            .buffer_unordered(parallelism)
            .collect()
            .await;
        results.extend(deleted);
        for op in delete_dirs {
            results.push(self.run(op, &abort, &failures).await);
        }

        results
    }

    async fn run(&self, op: Operation, abort: &CancellationToken, failures: &AtomicUsize) -> (Operation, OpOutcome) {
        if abort.is_cancelled() {
            return (op, OpOutcome::Skipped);
        }

        self.progress.operation_started(&op);
        let outcome = match self.apply(&op).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Failed to {}: {}", op, e);
                let failed = failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failed > self.config.max_failures && !abort.is_cancelled() {
                    error!("{} operations failed; not starting any more", failed);
                    abort.cancel();
                }
                OpOutcome::Failed(e.to_string())
            }
        };
        self.progress.operation_finished(&op, &outcome);
        (op, outcome)
    }

    async fn apply(&self, op: &Operation) -> Result<OpOutcome, StorageError> {
        let ctx = TransferContext {
            root: self.root,
            storage: self.storage,
            retry: &self.config.retry,
        };
        match *op {
            Operation::CreateDir { ref path, on: Side::Local } => transfer::create_dir_local(&ctx, path).await,
            Operation::CreateDir { ref path, on: Side::Remote } => transfer::create_dir_remote(&ctx, path).await,
            Operation::Copy {
                ref path,
                from: Side::Local,
                ref expected_source,
                ref expected_dest,
            } => transfer::upload(&ctx, path, expected_source, expected_dest.as_ref()).await,
            Operation::Copy {
                ref path,
                from: Side::Remote,
                ref expected_source,
                ref expected_dest,
            } => transfer::download(&ctx, path, expected_source, expected_dest.as_ref()).await,
            Operation::Delete {
                ref path,
                on: Side::Local,
                ref expected,
            } => transfer::delete_local(&ctx, path, expected).await,
            Operation::Delete {
                ref path,
                on: Side::Remote,
                ref expected,
            } => transfer::delete_remote(&ctx, path, expected).await,
            Operation::PreserveLocal {
                ref path,
                ref renamed_to,
                ref expected,
            } => transfer::preserve_local(&ctx, path, renamed_to, expected).await,
        }
    }
}
