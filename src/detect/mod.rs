//! Update detection: what each side looks like right now.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::{Ignore, SyncConfig};
use crate::error::SyncError;
use crate::retry::with_retry;
use crate::state::EntryState;
use crate::storage::{is_storable_key, StorageClient};
use crate::util::relative_key;

mod ext;
mod util;

pub use self::ext::is_item_in_sync;
pub use self::util::check_root_exists;

/// Current state of one side, keyed by relative path.
pub type Listing = BTreeMap<String, EntryState>;

/// Both sides, observed at the start of a pass.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub local: Listing,
    pub remote: Listing,
    /// Remote directories backed by a marker object. The others only exist
    /// while something beneath them does.
    pub remote_markers: BTreeSet<String>,
}

/// Walks the local root. Entries deleted while the walk is underway are skipped.
pub fn scan_local(root: &Path, ignore: &Ignore) -> Result<Listing, SyncError> {
    let mut listing = Listing::new();

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| match relative_key(root, entry.path()) {
            Some(key) => {
                if !is_storable_key(&key) {
                    warn!("Skipping {:?}: name cannot be stored remotely", key);
                    return false;
                }
                let ignored = ignore.is_ignored(&key);
                if ignored {
                    debug!("Ignoring entry {:?}", key);
                }
                !ignored
            }
            None => true,
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                if e.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) {
                    debug!("Entry vanished during scan: {:?}", e.path());
                    continue;
                }
                return Err(e.into());
            }
        };

        let key = match relative_key(root, entry.path()) {
            Some(key) => key,
            None => {
                warn!("Skipping {:?}: name is not valid UTF-8", entry.path());
                continue;
            }
        };

        if entry.file_type().is_symlink() {
            debug!("Skipping symlink {:?}", key);
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                if e.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) {
                    debug!("Entry vanished during scan: {:?}", key);
                    continue;
                }
                return Err(e.into());
            }
        };

        match EntryState::from_metadata(&metadata) {
            Some(state) => {
                trace!("Adding local entry {:?}", key);
                listing.insert(key, state);
            }
            None => debug!("Skipping special file {:?}", key),
        }
    }

    Ok(listing)
}

/// Lists the remote namespace, turning markers and key prefixes into directories.
/// Also returns the directories that have a marker.
pub async fn scan_remote(storage: &dyn StorageClient, config: &SyncConfig) -> Result<(Listing, BTreeSet<String>), SyncError> {
    let objects = with_retry(&config.retry, "list", || storage.list()).await?;
    debug!("Remote listing returned {} objects", objects.len());

    let mut markers: BTreeSet<String> = objects
        .iter()
        .filter_map(|object| util::marker_directory(&object.key))
        .map(str::to_owned)
        .collect();
    let mut listing = util::build_remote_listing(objects);
    listing.retain(|key, _| {
        let ignored = config.ignore.is_ignored(key);
        if ignored {
            debug!("Ignoring remote entry {:?}", key);
        }
        !ignored
    });
    markers.retain(|dir| listing.contains_key(dir));
    Ok((listing, markers))
}

/// Observes both sides concurrently.
pub async fn observe(root: &Path, storage: &dyn StorageClient, config: &SyncConfig) -> Result<Observation, SyncError> {
    let local_root: PathBuf = root.to_path_buf();
    let ignore = config.ignore.clone();
    let local = tokio::task::spawn_blocking(move || scan_local(&local_root, &ignore));

    let (local, remote) = tokio::join!(local, scan_remote(storage, config));
    let local = local.map_err(|e| SyncError::Io(io::Error::new(io::ErrorKind::Other, e)))??;
    let (remote, remote_markers) = remote?;

    info!("Observed {} local and {} remote entries", local.len(), remote.len());
    Ok(Observation {
        local,
        remote,
        remote_markers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use bytes::Bytes;
    use crate::storage::ObjectStoreClient;

    #[test]
    fn local_scan_skips_ignored_subtrees() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("keep/inner")).unwrap();
        fs::create_dir_all(dir.path().join("skip/inner")).unwrap();
        fs::write(dir.path().join("keep/inner/a.txt"), b"a").unwrap();
        fs::write(dir.path().join("skip/inner/b.txt"), b"b").unwrap();
        fs::write(dir.path().join(".s3ftp-c.txt.x1.part"), b"c").unwrap();

        let mut ignore = Ignore::default();
        ignore.paths.push("skip".to_owned());
        let listing = scan_local(dir.path(), &ignore).unwrap();

        let keys: Vec<&str> = listing.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["keep", "keep/inner", "keep/inner/a.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn local_scan_skips_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("real.txt"), b"a").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt")).unwrap();

        let listing = scan_local(dir.path(), &Ignore::nothing()).unwrap();
        assert!(listing.contains_key("real.txt"));
        assert!(!listing.contains_key("link.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn local_scan_skips_unstorable_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("bad\u{1}dir")).unwrap();
        fs::write(dir.path().join("bad\u{1}dir/inner.txt"), b"a").unwrap();
        fs::write(dir.path().join("fine [1].txt"), b"b").unwrap();

        let listing = scan_local(dir.path(), &Ignore::nothing()).unwrap();
        let keys: Vec<&str> = listing.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["fine [1].txt"]);
    }

    #[tokio::test]
    async fn remote_scan_applies_ignore_rules() {
        let client = ObjectStoreClient::in_memory();
        client.put("docs/a.txt", Bytes::from_static(b"a")).await.unwrap();
        client.put("tmp/b.txt", Bytes::from_static(b"b")).await.unwrap();
        client.put("tmp/.s3ftp-dir", Bytes::new()).await.unwrap();
        client.put("empty/.s3ftp-dir", Bytes::new()).await.unwrap();

        let mut config = SyncConfig::default();
        config.ignore.paths.push("tmp".to_owned());
        let (listing, markers) = scan_remote(&client, &config).await.unwrap();

        let keys: Vec<&str> = listing.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["docs", "docs/a.txt", "empty"]);
        let markers: Vec<&str> = markers.iter().map(String::as_str).collect();
        assert_eq!(markers, vec!["empty"]);
    }
}
