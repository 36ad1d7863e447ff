use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::archive::BaselineEntry;
use crate::state::EntryState;
use crate::Side;

/// How one path changed since the last pass.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Disposition {
    Unchanged,
    AddedLocal,
    AddedRemote,
    ModifiedLocal,
    ModifiedRemote,
    DeletedLocal,
    DeletedRemote,
    Conflict,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match *self {
            Disposition::Unchanged => "unchanged",
            Disposition::AddedLocal => "added-local",
            Disposition::AddedRemote => "added-remote",
            Disposition::ModifiedLocal => "modified-local",
            Disposition::ModifiedRemote => "modified-remote",
            Disposition::DeletedLocal => "deleted-local",
            Disposition::DeletedRemote => "deleted-remote",
            Disposition::Conflict => "conflict",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Disposition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Disposition::Unchanged,
            Disposition::AddedLocal,
            Disposition::AddedRemote,
            Disposition::ModifiedLocal,
            Disposition::ModifiedRemote,
            Disposition::DeletedLocal,
            Disposition::DeletedRemote,
            Disposition::Conflict,
        ]
        .into_iter()
        .find(|d| d.as_str() == s)
        .ok_or_else(|| format!("unknown disposition: {}", s))
    }
}

/// The result of classification.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Verdict {
    Settled(Disposition),
    /// Gone from both sides; the baseline entry is simply dropped.
    Converged,
    /// Present on both sides and the baseline can't tell whether they match.
    NeedsComparison,
}

/// Classifies one path from its (local-now, remote-now, baseline) triple.
///
/// Passing no baseline gives baseline-mode semantics: nothing is ever deleted.
pub fn classify(local: Option<&EntryState>, remote: Option<&EntryState>, baseline: Option<&BaselineEntry>) -> Verdict {
    match (local, remote) {
        (None, None) => Verdict::Converged,
        (Some(local), Some(remote)) => {
            if local.kind != remote.kind {
                return Verdict::Settled(Disposition::Conflict);
            }
            if local.is_dir() {
                return Verdict::Settled(Disposition::Unchanged);
            }
            match baseline {
                None => Verdict::NeedsComparison,
                Some(baseline) => {
                    let local_changed = local.changed_since(&baseline.local, Side::Local);
                    let remote_changed = remote.changed_since(&baseline.remote, Side::Remote);
                    match (local_changed, remote_changed) {
                        (false, false) => Verdict::Settled(Disposition::Unchanged),
                        (true, false) => Verdict::Settled(Disposition::ModifiedLocal),
                        (false, true) => Verdict::Settled(Disposition::ModifiedRemote),
                        (true, true) => Verdict::NeedsComparison,
                    }
                }
            }
        }
        (Some(local), None) => match baseline {
            None => Verdict::Settled(Disposition::AddedLocal),
            Some(baseline) => {
                if local.changed_since(&baseline.local, Side::Local) {
                    debug!("Deleted remotely but changed locally");
                    Verdict::Settled(Disposition::Conflict)
                } else {
                    Verdict::Settled(Disposition::DeletedRemote)
                }
            }
        },
        (None, Some(remote)) => match baseline {
            None => Verdict::Settled(Disposition::AddedRemote),
            Some(baseline) => {
                if remote.changed_since(&baseline.remote, Side::Remote) {
                    debug!("Deleted locally but changed remotely");
                    Verdict::Settled(Disposition::Conflict)
                } else {
                    Verdict::Settled(Disposition::DeletedLocal)
                }
            }
        },
    }
}

/// Settles a `NeedsComparison` verdict once the contents have been compared.
pub fn after_comparison(in_sync: bool) -> Disposition {
    if in_sync {
        Disposition::Unchanged
    } else {
        Disposition::Conflict
    }
}
