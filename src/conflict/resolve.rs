use std::cmp::Ordering;
use chrono::{DateTime, Utc};

use crate::conflict::{conflict_path, ConflictPolicy, Resolution};
use crate::detect::Observation;
use crate::state::EntryState;
use crate::util::FnvHashSet;

/// Hands out conflict names that collide with nothing on either side.
pub struct ConflictNamer<'a> {
    tag: String,
    observation: &'a Observation,
    taken: FnvHashSet<String>,
}

impl<'a> ConflictNamer<'a> {
    pub fn new(pass_started: DateTime<Utc>, observation: &'a Observation) -> Self {
        ConflictNamer {
            tag: pass_started.format("%Y%m%dT%H%M%SZ").to_string(),
            observation,
            taken: Default::default(),
        }
    }

    pub fn unique_name(&mut self, path: &str) -> String {
        let mut candidate = conflict_path(path, &self.tag);
        let mut n = 1;
        while self.is_taken(&candidate) {
            candidate = conflict_path(path, &format!("{}-{}", self.tag, n));
            n += 1;
        }
        self.taken.insert(candidate.clone());
        candidate
    }

    fn is_taken(&self, candidate: &str) -> bool {
        self.taken.contains(candidate)
            || self.observation.local.contains_key(candidate)
            || self.observation.remote.contains_key(candidate)
    }
}

/// Decides how a conflict is settled.
///
/// When one side no longer has the entry, the surviving version wins so nothing is lost.
pub fn resolve(
    path: &str,
    local: Option<&EntryState>,
    remote: Option<&EntryState>,
    policy: ConflictPolicy,
    namer: &mut ConflictNamer,
) -> Resolution {
    match (local, remote) {
        (Some(_), None) => return Resolution::UseLocal,
        (None, Some(_)) | (None, None) => return Resolution::UseRemote,
        (Some(local), Some(remote)) => {
            if policy == ConflictPolicy::NewestWins && local.kind == remote.kind {
                match newer(local, remote) {
                    Some(Ordering::Greater) => return Resolution::UseLocal,
                    Some(Ordering::Less) => return Resolution::UseRemote,
                    _ => debug!("Can't tell which copy of {:?} is newer, keeping both", path),
                }
            }
        }
    }
    Resolution::KeepBoth {
        renamed_to: namer.unique_name(path),
    }
}

fn newer(local: &EntryState, remote: &EntryState) -> Option<Ordering> {
    let (l, r) = (local.mod_time?, remote.mod_time?);
    Some(l.cmp(&r))
}
