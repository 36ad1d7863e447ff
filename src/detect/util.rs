use std::collections::BTreeMap;
use std::path::Path;

use crate::error::SyncError;
use crate::state::EntryState;
use crate::storage::{RemoteObject, DIRECTORY_MARKER};
use crate::util::{ancestors, parent_key};

pub fn check_root_exists(root: &Path) -> Result<(), SyncError> {
    if !root.is_dir() {
        return Err(SyncError::RootDoesntExist(root.to_path_buf()));
    }
    Ok(())
}

/// Splits a directory marker key into the directory it materializes.
pub fn marker_directory(key: &str) -> Option<&str> {
    key.strip_suffix(DIRECTORY_MARKER)
        .and_then(|rest| rest.strip_suffix('/'))
        .filter(|dir| !dir.is_empty())
}

/// Turns a flat object listing into files and the directories they imply.
pub fn build_remote_listing<I>(objects: I) -> BTreeMap<String, EntryState>
where
    I: IntoIterator<Item = RemoteObject>,
{
    let mut files = BTreeMap::new();
    let mut directories = BTreeMap::new();

    for object in objects {
        if object.key == DIRECTORY_MARKER {
            trace!("Ignoring root-level directory marker");
            continue;
        }
        if let Some(dir) = marker_directory(&object.key) {
            trace!("Directory marker for {:?}", dir);
            insert_directory_with_ancestors(&mut directories, dir);
            continue;
        }
        if let Some(parent) = parent_key(&object.key) {
            insert_directory_with_ancestors(&mut directories, parent);
        }
        files.insert(object.key.clone(), object.state());
    }

    for (dir, state) in directories {
        if files.contains_key(&dir) {
            warn!("Remote key {:?} is both an object and a directory prefix; treating it as a directory", dir);
        }
        files.insert(dir, state);
    }
    files
}

fn insert_directory_with_ancestors(directories: &mut BTreeMap<String, EntryState>, dir: &str) {
    directories
        .entry(dir.to_owned())
        .or_insert_with(EntryState::directory);
    for ancestor in ancestors(dir) {
        directories
            .entry(ancestor.to_owned())
            .or_insert_with(EntryState::directory);
    }
}
