//! Keeps a local file-transfer root and an object-storage bucket in step.

#[macro_use]
extern crate log;

use std::fmt;
use serde::Serialize;

pub mod archive;
pub mod config;
pub mod conflict;
pub mod detect;
pub mod engine;
pub mod error;
pub mod projection;
pub mod propagate;
pub mod reconcile;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod storage;
pub mod util;
mod compare_files;
mod transfer;

pub use crate::engine::{ReconcileMode, Reconciler};
pub use crate::error::SyncError;
pub use crate::report::ReconcileReport;

/// One of the two replicas of a root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Side::Local => f.write_str("local"),
            Side::Remote => f.write_str("remote"),
        }
    }
}
