use std::path::Path;

use crate::compare_files::contents_equal;
use crate::config::SyncConfig;
use crate::retry::with_retry;
use crate::state::EntryState;
use crate::storage::{StorageClient, StorageError};
use crate::util::local_path;

/// Decides whether an entry present on both sides holds the same thing on each.
///
/// `changed_since_baseline` is set when both sides moved away from a recorded
/// baseline entry. Without a content comparison equal sizes prove nothing then,
/// so the entry is reported as out of sync.
pub async fn is_item_in_sync(
    root: &Path,
    key: &str,
    local: &EntryState,
    remote: &EntryState,
    changed_since_baseline: bool,
    storage: &dyn StorageClient,
    config: &SyncConfig,
) -> Result<bool, StorageError> {
    trace!("Checking for incompatible entry types (eg: file vs folder)");
    if local.kind != remote.kind {
        warn!("Difference at {:?} - types not equal", key);
        return Ok(false);
    }
    if local.is_dir() {
        return Ok(true);
    }

    trace!("Checking for different file sizes");
    if local.size != remote.size {
        debug!("Difference at path {:?} - file sizes not equal: {} != {}", key, local.size, remote.size);
        return Ok(false);
    }

    if !config.compare_file_contents {
        if changed_since_baseline {
            debug!("Difference at path {:?} - both sides changed and contents are not compared", key);
            return Ok(false);
        }
        return Ok(true);
    }

    // If they are both files, we will compare the contents
    trace!("Checking file contents");
    let path = local_path(root, key);
    let remote_bytes = with_retry(&config.retry, "get", || storage.get(key)).await?;
    if !contents_equal(&path, remote_bytes).await? {
        debug!("Difference at path {:?} - file contents not equal", key);
        return Ok(false);
    }

    Ok(true)
}
