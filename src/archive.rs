use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::error::SyncError;
use crate::state::EntryState;
use crate::util::hash_single;

const ARCHIVE_VERSION: u32 = 3;

/// The state of one path on both sides when it was last known to be converged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineEntry {
    pub local: EntryState,
    pub remote: EntryState,
}

/// The last-known-converged state of a root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineSnapshot {
    pub root: PathBuf,
    pub generation: u64,
    pub reconciled_at: DateTime<Utc>,
    pub entries: BTreeMap<String, BaselineEntry>,
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("baseline io error: {0}")]
    Io(#[from] io::Error),
    #[error("baseline could not be encoded or decoded: {0}")]
    Serialize(#[from] bincode::Error),
    #[error("baseline written with unsupported format version {0}")]
    InvalidVersion(u32),
}

/// Stores one baseline snapshot per root inside `directory`.
#[derive(Debug, Clone)]
pub struct Archive {
    pub directory: PathBuf,
}

impl Archive {
    pub fn new(directory: PathBuf) -> io::Result<Self> {
        // creates the archive directory
        if !directory.exists() {
            fs::create_dir_all(&directory)?;
        }
        Ok(Archive { directory })
    }

    pub fn file_for_root(&self, root: &Path) -> PathBuf {
        self.directory.join(format!("{:016x}.baseline", hash_single(root)))
    }

    fn lock_file_for_root(&self, root: &Path) -> PathBuf {
        self.directory.join(format!("{:016x}.lock", hash_single(root)))
    }

    /// Loads the snapshot for `root`. `None` means a baseline pass is required.
    pub fn load(&self, root: &Path) -> Result<Option<BaselineSnapshot>, PersistError> {
        let archive_file = self.file_for_root(root);
        let file = match File::open(&archive_file) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No baseline at {:?}", archive_file);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match read_snapshot(&mut BufReader::new(file)) {
            Ok(snapshot) => {
                if snapshot.root != root {
                    warn!("Baseline {:?} belongs to {:?}, not {:?}; ignoring it", archive_file, snapshot.root, root);
                    Ok(None)
                } else {
                    Ok(Some(snapshot))
                }
            }
            Err(PersistError::InvalidVersion(version)) => {
                info!("Archive file {:?} using outdated version ({})", archive_file, version);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Atomically replaces the snapshot for `snapshot.root`.
    pub fn commit(&self, snapshot: &BaselineSnapshot) -> Result<(), PersistError> {
        let archive_file = self.file_for_root(&snapshot.root);
        debug!("Writing archive file {:?} (generation {})", archive_file, snapshot.generation);

        let mut temp = NamedTempFile::new_in(&self.directory)?;
        {
            let mut out = BufWriter::new(temp.as_file_mut());
            write_snapshot(&mut out, snapshot)?;
            out.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&archive_file).map_err(|e| e.error)?;
        sync_directory(&self.directory)?;
        Ok(())
    }

    /// Takes the exclusive per-root lock that keeps passes from overlapping.
    pub fn lock(&self, root: &Path) -> Result<RootLock, SyncError> {
        let path = self.lock_file_for_root(root);
        let file = OpenOptions::new().create(true).write(true).truncate(false).open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                trace!("Locked {:?}", path);
                Ok(RootLock { file, path })
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(SyncError::PassInProgress(root.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Held for the duration of a pass; released on drop.
#[derive(Debug)]
pub struct RootLock {
    file: File,
    path: PathBuf,
}

impl Drop for RootLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to unlock {:?}: {}", self.path, e);
        }
    }
}

#[cfg(unix)]
fn sync_directory(directory: &Path) -> io::Result<()> {
    File::open(directory)?.sync_all()
}

#[cfg(not(unix))]
fn sync_directory(_: &Path) -> io::Result<()> {
    Ok(())
}

/// reads a snapshot from a binary stream
fn read_snapshot<R: io::Read>(read: &mut R) -> Result<BaselineSnapshot, PersistError> {
    let version = read.read_u32::<LittleEndian>()?;
    if version != ARCHIVE_VERSION {
        return Err(PersistError::InvalidVersion(version));
    }
    Ok(bincode::deserialize_from(read)?)
}

// writes a snapshot to a binary stream
fn write_snapshot<W: io::Write>(out: &mut W, snapshot: &BaselineSnapshot) -> Result<(), PersistError> {
    out.write_u32::<LittleEndian>(ARCHIVE_VERSION)?;
    bincode::serialize_into(out, snapshot)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(root: &Path) -> BaselineSnapshot {
        let mut entries = BTreeMap::new();
        entries.insert(
            "a.txt".to_owned(),
            BaselineEntry {
                local: EntryState::file(3, Some(1_000), Some("1:1.0".into())),
                remote: EntryState::file(3, Some(1_000), Some("\"etag\"".into())),
            },
        );
        BaselineSnapshot {
            root: root.to_path_buf(),
            generation: 1,
            reconciled_at: Utc::now(),
            entries,
        }
    }

    #[test]
    fn commit_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(dir.path().join("state")).unwrap();
        let root = Path::new("/srv/home");

        assert!(archive.load(root).unwrap().is_none());
        let written = snapshot(root);
        archive.commit(&written).unwrap();
        assert_eq!(archive.load(root).unwrap(), Some(written));
    }

    #[test]
    fn outdated_version_forces_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(dir.path().to_path_buf()).unwrap();
        let root = Path::new("/srv/home");

        let mut file = File::create(archive.file_for_root(root)).unwrap();
        file.write_u32::<LittleEndian>(ARCHIVE_VERSION - 1).unwrap();
        drop(file);

        assert!(archive.load(root).unwrap().is_none());
    }

    #[test]
    fn truncated_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(dir.path().to_path_buf()).unwrap();
        let root = Path::new("/srv/home");

        let mut file = File::create(archive.file_for_root(root)).unwrap();
        file.write_u32::<LittleEndian>(ARCHIVE_VERSION).unwrap();
        file.write_all(&[1, 2]).unwrap();
        drop(file);

        assert!(archive.load(root).is_err());
    }

    #[test]
    fn lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(dir.path().to_path_buf()).unwrap();
        let root = Path::new("/srv/home");

        let held = archive.lock(root).unwrap();
        match archive.lock(root) {
            Err(SyncError::PassInProgress(path)) => assert_eq!(path, root),
            other => panic!("expected contention, got {:?}", other),
        }
        drop(held);
        assert!(archive.lock(root).is_ok());
    }
}
