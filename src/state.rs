use std::fs::Metadata;
use std::io;
use std::path::Path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Side;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
}

/// Mirrors the state of a path on one side at the moment it was observed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryState {
    pub kind: EntryKind,
    /// Bytes, always zero for directories.
    pub size: u64,
    /// Milliseconds since the epoch.
    pub mod_time: Option<i64>,
    /// Inode and ctime locally, the ETag remotely.
    pub fingerprint: Option<String>,
}

impl EntryState {
    pub fn directory() -> Self {
        EntryState {
            kind: EntryKind::Directory,
            size: 0,
            mod_time: None,
            fingerprint: None,
        }
    }

    pub fn file(size: u64, mod_time: Option<i64>, fingerprint: Option<String>) -> Self {
        EntryState {
            kind: EntryKind::File,
            size,
            mod_time,
            fingerprint,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    /// Symlinks and special files have no state.
    pub fn from_metadata(metadata: &Metadata) -> Option<Self> {
        let ty = metadata.file_type();
        if ty.is_dir() {
            Some(EntryState::directory())
        } else if ty.is_file() {
            let mod_time = metadata.modified().ok().map(|time| DateTime::<Utc>::from(time).timestamp_millis());
            Some(EntryState::file(metadata.len(), mod_time, local_fingerprint(metadata)))
        } else {
            None
        }
    }

    /// Reads the current state of `path` without following symlinks.
    pub fn read(path: &Path) -> io::Result<Option<Self>> {
        match path.symlink_metadata() {
            Ok(metadata) => {
                if metadata.file_type().is_symlink() {
                    trace!("Skipping symlink {:?}", path);
                    Ok(None)
                } else {
                    Ok(EntryState::from_metadata(&metadata))
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Returns true if this entry differs from `previous`, as recorded on `side`.
    ///
    /// Directories only change by becoming files. Remote timestamps only carry
    /// whole seconds on most stores.
    pub fn changed_since(&self, previous: &EntryState, side: Side) -> bool {
        if self.kind != previous.kind {
            return true;
        }
        if self.is_dir() {
            return false;
        }
        if self.size != previous.size || self.fingerprint != previous.fingerprint {
            return true;
        }
        match side {
            Side::Local => self.mod_time != previous.mod_time,
            Side::Remote => self.mod_time.map(|t| t.div_euclid(1000)) != previous.mod_time.map(|t| t.div_euclid(1000)),
        }
    }
}

#[cfg(unix)]
fn local_fingerprint(metadata: &Metadata) -> Option<String> {
    use std::os::unix::fs::MetadataExt;
    Some(format!("{}:{}.{}", metadata.ino(), metadata.ctime(), metadata.ctime_nsec()))
}

#[cfg(not(unix))]
fn local_fingerprint(_: &Metadata) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directories_only_change_kind() {
        let dir = EntryState::directory();
        assert!(!dir.changed_since(&EntryState::directory(), Side::Local));
        assert!(dir.changed_since(&EntryState::file(0, None, None), Side::Remote));
    }

    #[test]
    fn remote_times_compare_by_second() {
        let before = EntryState::file(4, Some(10_200), Some("\"a\"".into()));
        let after = EntryState::file(4, Some(10_900), Some("\"a\"".into()));
        assert!(!after.changed_since(&before, Side::Remote));
        assert!(after.changed_since(&before, Side::Local));
    }

    #[test]
    fn fingerprint_or_size_changes() {
        let before = EntryState::file(4, Some(1), Some("1:1.0".into()));
        assert!(EntryState::file(5, Some(1), Some("1:1.0".into())).changed_since(&before, Side::Local));
        assert!(EntryState::file(4, Some(1), Some("1:2.0".into())).changed_since(&before, Side::Local));
    }

    #[test]
    fn reading_missing_path_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(EntryState::read(&dir.path().join("missing")).unwrap(), None);
        std::fs::write(dir.path().join("file"), b"abc").unwrap();
        let state = EntryState::read(&dir.path().join("file")).unwrap().unwrap();
        assert_eq!(state.size, 3);
        assert!(state.is_file());
    }
}
