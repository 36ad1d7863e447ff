use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Bound;
use chrono::{DateTime, Utc};

use crate::archive::BaselineEntry;
use crate::conflict::resolve::{resolve, ConflictNamer};
use crate::conflict::{Conflict, ConflictPolicy, Resolution};
use crate::detect::Observation;
use crate::reconcile::Disposition;
use crate::state::EntryState;
use crate::util::{depth, is_descendant};
use crate::Side;

/// One unit of work. Every operation carries the state it expects to find,
/// which is re-checked immediately before it is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateDir {
        path: String,
        on: Side,
    },
    Copy {
        path: String,
        from: Side,
        expected_source: EntryState,
        expected_dest: Option<EntryState>,
    },
    Delete {
        path: String,
        on: Side,
        expected: EntryState,
    },
    /// Moves the local entry aside; a renamed file is also uploaded under its new name.
    PreserveLocal {
        path: String,
        renamed_to: String,
        expected: EntryState,
    },
}

impl Operation {
    pub fn path(&self) -> &str {
        match *self {
            Operation::CreateDir { ref path, .. }
            | Operation::Copy { ref path, .. }
            | Operation::Delete { ref path, .. }
            | Operation::PreserveLocal { ref path, .. } => path,
        }
    }

    pub fn is_directory_op(&self) -> bool {
        match *self {
            Operation::CreateDir { .. } => true,
            Operation::Delete { ref expected, .. } => expected.is_dir(),
            _ => false,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Operation::CreateDir { ref path, on } => write!(f, "create directory {} ({})", path, on),
            Operation::Copy { ref path, from: Side::Local, .. } => write!(f, "upload {}", path),
            Operation::Copy { ref path, from: Side::Remote, .. } => write!(f, "download {}", path),
            Operation::Delete { ref path, on, .. } => write!(f, "delete {} ({})", path, on),
            Operation::PreserveLocal { ref path, ref renamed_to, .. } => write!(f, "preserve {} as {}", path, renamed_to),
        }
    }
}

/// Everything a pass intends to do.
#[derive(Debug, Default)]
pub struct Plan {
    pub operations: Vec<Operation>,
    pub conflicts: Vec<Conflict>,
    /// Entries that need no work and go straight into the next baseline.
    pub settled: BTreeMap<String, BaselineEntry>,
    pub counts: BTreeMap<Disposition, usize>,
    /// Entries left alone this pass, e.g. the contents of a directory that was moved aside.
    pub deferred: Vec<String>,
}

impl Plan {
    pub fn count(&self, disposition: Disposition) -> usize {
        self.counts.get(&disposition).cloned().unwrap_or(0)
    }
}

/// Turns settled dispositions into operations.
pub fn build_plan(
    observation: &Observation,
    baseline: Option<&BTreeMap<String, BaselineEntry>>,
    mut dispositions: BTreeMap<String, Disposition>,
    unresolved: &BTreeSet<String>,
    policy: ConflictPolicy,
    started: DateTime<Utc>,
) -> Plan {
    restore_directories_with_survivors(observation, &mut dispositions, unresolved);

    let mut plan = Plan::default();
    let mut namer = ConflictNamer::new(started, observation);
    let mut suppressed: Vec<String> = Vec::new();

    for (path, disposition) in dispositions {
        *plan.counts.entry(disposition).or_insert(0) += 1;

        if suppressed.iter().any(|dir| is_descendant(&path, dir)) {
            debug!("Leaving {:?} for the next pass (parent moved aside)", path);
            plan.deferred.push(path);
            continue;
        }

        let local = observation.local.get(&path);
        let remote = observation.remote.get(&path);

        match disposition {
            Disposition::Unchanged => match (local, remote) {
                (Some(local), Some(remote)) => {
                    plan.settled.insert(
                        path,
                        BaselineEntry {
                            local: local.clone(),
                            remote: remote.clone(),
                        },
                    );
                }
                _ => warn!("Unchanged entry {:?} is missing on one side", path),
            },
            Disposition::AddedLocal | Disposition::ModifiedLocal => {
                transfer(&mut plan, path, Side::Local, local, remote);
            }
            Disposition::AddedRemote | Disposition::ModifiedRemote => {
                transfer(&mut plan, path, Side::Remote, remote, local);
            }
            Disposition::DeletedLocal => {
                if let Some(remote) = remote {
                    plan.operations.push(Operation::Delete {
                        path,
                        on: Side::Remote,
                        expected: remote.clone(),
                    });
                }
            }
            Disposition::DeletedRemote => {
                if let Some(local) = local {
                    plan.operations.push(Operation::Delete {
                        path,
                        on: Side::Local,
                        expected: local.clone(),
                    });
                }
            }
            Disposition::Conflict => {
                let resolution = resolve(&path, local, remote, policy, &mut namer);
                info!("Conflict at {:?}: {}", path, resolution);

                match resolution {
                    Resolution::UseLocal => transfer(&mut plan, path.clone(), Side::Local, local, remote),
                    Resolution::UseRemote => transfer(&mut plan, path.clone(), Side::Remote, remote, local),
                    Resolution::KeepBoth { ref renamed_to } => {
                        if let Some(local) = local {
                            if local.is_dir() {
                                suppressed.push(path.clone());
                            }
                            plan.operations.push(Operation::PreserveLocal {
                                path: path.clone(),
                                renamed_to: renamed_to.clone(),
                                expected: local.clone(),
                            });
                        }
                        // the local path is free once the rename has happened
                        transfer(&mut plan, path.clone(), Side::Remote, remote, None);
                    }
                }

                plan.conflicts.push(Conflict {
                    baseline: baseline.and_then(|entries| entries.get(&path)).cloned(),
                    local: local.cloned(),
                    remote: remote.cloned(),
                    path,
                    resolution,
                });
            }
        }
    }

    persist_implied_directories(&mut plan, observation);
    plan
}

/// A remote directory without a marker disappears with its last object, which
/// the next pass would read as a remote deletion. Every remote directory that
/// survives this pass gets a marker.
fn persist_implied_directories(plan: &mut Plan, observation: &Observation) {
    let mut implied: Vec<String> = Vec::new();
    for (path, state) in &observation.remote {
        if !state.is_dir() || observation.remote_markers.contains(path) {
            continue;
        }
        if plan.deferred.iter().any(|deferred| deferred == path) {
            continue;
        }
        let handled = plan.operations.iter().any(|op| match *op {
            Operation::CreateDir { path: ref p, on: Side::Remote } | Operation::Delete { path: ref p, on: Side::Remote, .. } => p == path,
            _ => false,
        });
        if !handled {
            implied.push(path.clone());
        }
    }

    for path in implied {
        debug!("Remote directory {:?} has no marker", path);
        plan.operations.push(Operation::CreateDir { path, on: Side::Remote });
    }
}

/// Propagates `source` (the state on `from`) to the other side.
fn transfer(plan: &mut Plan, path: String, from: Side, source: Option<&EntryState>, dest: Option<&EntryState>) {
    let source = match source {
        Some(source) => source,
        None => {
            warn!("Nothing to propagate at {:?} from {}", path, from);
            return;
        }
    };

    if source.is_dir() {
        match dest {
            Some(dest) if dest.is_dir() => {
                plan.settled.insert(
                    path,
                    BaselineEntry {
                        local: EntryState::directory(),
                        remote: EntryState::directory(),
                    },
                );
            }
            _ => plan.operations.push(Operation::CreateDir { path, on: from.other() }),
        }
    } else {
        plan.operations.push(Operation::Copy {
            path,
            from,
            expected_source: source.clone(),
            expected_dest: dest.cloned(),
        });
    }
}

/// A directory deleted on one side can't be deleted from the other while
/// something beneath it is staying; it is restored instead.
fn restore_directories_with_survivors(
    observation: &Observation,
    dispositions: &mut BTreeMap<String, Disposition>,
    unresolved: &BTreeSet<String>,
) {
    let mut directory_deletes: Vec<String> = dispositions
        .iter()
        .filter(|&(path, disposition)| {
            let survivor = match *disposition {
                Disposition::DeletedLocal => observation.remote.get(path),
                Disposition::DeletedRemote => observation.local.get(path),
                _ => None,
            };
            survivor.map_or(false, EntryState::is_dir)
        })
        .map(|(path, _)| path.clone())
        .collect();

    // deepest first, so a restored child keeps its ancestors alive
    directory_deletes.sort_by(|a, b| depth(b).cmp(&depth(a)).then_with(|| a.cmp(b)));

    for dir in directory_deletes {
        let prefix = format!("{}/", dir);
        let survives = dispositions
            .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
            .take_while(|(path, _)| path.starts_with(&prefix))
            .any(|(_, disposition)| !matches!(disposition, Disposition::DeletedLocal | Disposition::DeletedRemote))
            || unresolved.iter().any(|path| is_descendant(path, &dir));

        if survives {
            info!("Directory {:?} was deleted on one side but still has contents on the other", dir);
            dispositions.insert(dir, Disposition::Conflict);
        }
    }
}
