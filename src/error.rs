use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::archive::PersistError;
use crate::projection::MountError;
use crate::report::ReconcileReport;
use crate::storage::StorageError;

/// Pass-level failures. Entry-level failures are collected in the report instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("root does not exist: {0:?}")]
    RootDoesntExist(PathBuf),
    #[error("a reconciliation pass is already running for {0:?}")]
    PassInProgress(PathBuf),
    #[error("projection unavailable: {0}")]
    Mount(#[from] MountError),
    #[error("baseline error: {0}")]
    Persist(#[from] PersistError),
    #[error("remote listing failed: {0}")]
    Storage(#[from] StorageError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("walk dir error: {0}")]
    WalkDir(#[from] walkdir::Error),
    /// The pass was cancelled; the baseline was left untouched.
    #[error("pass cancelled after {} completed operations", .0.completed.len())]
    Cancelled(Box<ReconcileReport>),
    /// Some operations failed; the baseline was left untouched.
    #[error("pass incomplete: {} operations failed, {} completed", .0.failed.len(), .0.completed.len())]
    Incomplete(Box<ReconcileReport>),
}

impl SyncError {
    /// The partial report of a pass that ran but didn't commit.
    pub fn report(&self) -> Option<&ReconcileReport> {
        match *self {
            SyncError::Cancelled(ref report) | SyncError::Incomplete(ref report) => Some(report),
            _ => None,
        }
    }
}
