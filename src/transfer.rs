//! The individual operations. Each one re-reads the state it depends on
//! immediately before acting and reports `Stale` instead of clobbering a
//! concurrent change.

use std::io;
use std::path::{Path, PathBuf};
use bytes::Bytes;
use futures::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::archive::BaselineEntry;
use crate::propagate::OpOutcome;
use crate::retry::{with_retry, RetryPolicy};
use crate::state::EntryState;
use crate::storage::{RemoteObject, StorageClient, StorageError, DIRECTORY_MARKER};
use crate::util::local_path;
use crate::Side;

/// What an operation needs to touch both sides.
pub struct TransferContext<'a> {
    pub root: &'a Path,
    pub storage: &'a dyn StorageClient,
    pub retry: &'a RetryPolicy,
}

impl<'a> TransferContext<'a> {
    fn local(&self, key: &str) -> PathBuf {
        local_path(self.root, key)
    }

    async fn stat_remote(&self, key: &str) -> Result<Option<RemoteObject>, StorageError> {
        let storage = self.storage;
        with_retry(self.retry, "stat", || storage.stat(key)).await
    }

    async fn put_remote(&self, key: &str, data: Bytes) -> Result<RemoteObject, StorageError> {
        let storage = self.storage;
        with_retry(self.retry, "put", || storage.put(key, data.clone())).await
    }

    async fn delete_remote_key(&self, key: &str) -> Result<(), StorageError> {
        let storage = self.storage;
        with_retry(self.retry, "delete", || storage.delete(key)).await
    }
}

fn local_matches(current: Option<&EntryState>, expected: Option<&EntryState>) -> bool {
    match (current, expected) {
        (None, None) => true,
        (Some(current), Some(expected)) => !current.changed_since(expected, Side::Local),
        _ => false,
    }
}

fn remote_matches(current: Option<&RemoteObject>, expected: Option<&EntryState>) -> bool {
    match (current, expected) {
        (None, None) => true,
        (Some(current), Some(expected)) => expected.is_file() && !current.state().changed_since(expected, Side::Remote),
        // remote directories are prefixes, not objects
        (None, Some(expected)) => expected.is_dir(),
        (Some(_), None) => false,
    }
}

async fn read_local(path: &Path) -> io::Result<Option<EntryState>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || EntryState::read(&path))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

fn stale(path: &str, why: &str) -> OpOutcome {
    info!("Deferring {:?}: {}", path, why);
    OpOutcome::Stale(why.to_owned())
}

/// Copies a local file to the bucket.
pub async fn upload(
    ctx: &TransferContext<'_>,
    key: &str,
    expected_source: &EntryState,
    expected_dest: Option<&EntryState>,
) -> Result<OpOutcome, StorageError> {
    let path = ctx.local(key);
    if !local_matches(read_local(&path).await?.as_ref(), Some(expected_source)) {
        return Ok(stale(key, "local file changed since the scan"));
    }
    if !remote_matches(ctx.stat_remote(key).await?.as_ref(), expected_dest) {
        return Ok(stale(key, "remote object changed since the scan"));
    }

    info!("Uploading {:?} ({} bytes)", key, expected_source.size);
    let storage = ctx.storage;
    let stored = match with_retry(ctx.retry, "put", || storage.put_file(key, &path)).await {
        Ok(stored) => stored,
        Err(StorageError::Io(ref e)) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(stale(key, "local file vanished"));
        }
        Err(e) => return Err(e),
    };

    // A write during the upload may have been sent only in part. Recording the
    // state from the scan makes the next pass see a local modification.
    let local = match read_local(&path).await? {
        Some(state) if !state.changed_since(expected_source, Side::Local) => state,
        _ => {
            info!("{:?} changed while it was uploaded; it will be sent again", key);
            expected_source.clone()
        }
    };

    Ok(OpOutcome::Applied(Some((
        key.to_owned(),
        BaselineEntry {
            local,
            remote: stored.state(),
        },
    ))))
}

/// Copies an object into the local tree through a temporary file that is renamed into place.
pub async fn download(
    ctx: &TransferContext<'_>,
    key: &str,
    expected_source: &EntryState,
    expected_dest: Option<&EntryState>,
) -> Result<OpOutcome, StorageError> {
    let path = ctx.local(key);
    if !local_matches(read_local(&path).await?.as_ref(), expected_dest) {
        return Ok(stale(key, "local entry changed since the scan"));
    }
    let object = match ctx.stat_remote(key).await? {
        Some(object) if remote_matches(Some(&object), Some(expected_source)) => object,
        _ => return Ok(stale(key, "remote object changed since the scan")),
    };

    let parent = match path.parent() {
        Some(parent) => parent.to_path_buf(),
        None => return Err(StorageError::Other(format!("{:?} has no parent directory", path))),
    };
    fs::create_dir_all(&parent).await?;

    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("download");
    let temp = tempfile::Builder::new()
        .prefix(&format!(".s3ftp-{}.", name))
        .suffix(".part")
        .tempfile_in(&parent)?;
    let (file, temp_path) = temp.into_parts();
    let mut file = fs::File::from_std(file);

    info!("Downloading {:?} ({} bytes)", key, object.size);
    let storage = ctx.storage;
    let mut stream = with_retry(ctx.retry, "get", || storage.get(key)).await?;
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    trace!("Wrote {} bytes to {:?}", written, temp_path);

    // the destination may have been written by a session during the download
    if !local_matches(read_local(&path).await?.as_ref(), expected_dest) {
        return Ok(stale(key, "local entry changed during the download"));
    }
    temp_path.persist(&path).map_err(|e| e.error)?;

    let local = match read_local(&path).await? {
        Some(state) => state,
        None => return Ok(stale(key, "downloaded file vanished")),
    };
    Ok(OpOutcome::Applied(Some((
        key.to_owned(),
        BaselineEntry {
            local,
            remote: object.state(),
        },
    ))))
}

pub async fn delete_remote(ctx: &TransferContext<'_>, key: &str, expected: &EntryState) -> Result<OpOutcome, StorageError> {
    if expected.is_dir() {
        info!("Removing remote directory marker for {:?}", key);
        ctx.delete_remote_key(&format!("{}/{}", key, DIRECTORY_MARKER)).await?;
        return Ok(OpOutcome::Applied(None));
    }

    if !remote_matches(ctx.stat_remote(key).await?.as_ref(), Some(expected)) {
        return Ok(stale(key, "remote object changed since the scan"));
    }
    info!("Removing remote object {:?}", key);
    ctx.delete_remote_key(key).await?;
    Ok(OpOutcome::Applied(None))
}

pub async fn delete_local(ctx: &TransferContext<'_>, key: &str, expected: &EntryState) -> Result<OpOutcome, StorageError> {
    let path = ctx.local(key);
    match read_local(&path).await? {
        None => {
            debug!("{:?} is already gone", key);
            return Ok(OpOutcome::Applied(None));
        }
        Some(current) => {
            if current.changed_since(expected, Side::Local) {
                return Ok(stale(key, "local entry changed since the scan"));
            }
        }
    }

    let result = if expected.is_dir() {
        let mut entries = fs::read_dir(&path).await?;
        if entries.next_entry().await?.is_some() {
            return Ok(stale(key, "directory is not empty"));
        }
        info!("Removing directory {:?}", key);
        fs::remove_dir(&path).await
    } else {
        info!("Removing file {:?}", key);
        fs::remove_file(&path).await
    };

    match result {
        Ok(()) => Ok(OpOutcome::Applied(None)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(OpOutcome::Applied(None)),
        Err(e) => Err(e.into()),
    }
}

pub async fn create_dir_local(ctx: &TransferContext<'_>, key: &str) -> Result<OpOutcome, StorageError> {
    let path = ctx.local(key);
    match read_local(&path).await? {
        Some(current) if current.is_file() => return Ok(stale(key, "a file now occupies the path")),
        Some(_) => {}
        None => {
            info!("Creating directory {:?}", key);
            fs::create_dir_all(&path).await?;
        }
    }
    Ok(OpOutcome::Applied(Some((key.to_owned(), directory_entry()))))
}

pub async fn create_dir_remote(ctx: &TransferContext<'_>, key: &str) -> Result<OpOutcome, StorageError> {
    if ctx.stat_remote(key).await?.is_some() {
        return Ok(stale(key, "a remote object now occupies the path"));
    }
    info!("Creating remote directory {:?}", key);
    ctx.put_remote(&format!("{}/{}", key, DIRECTORY_MARKER), Bytes::new()).await?;
    Ok(OpOutcome::Applied(Some((key.to_owned(), directory_entry()))))
}

/// Moves the local side of a conflict out of the way. A renamed file is
/// uploaded under its new name so both versions exist on both sides.
pub async fn preserve_local(
    ctx: &TransferContext<'_>,
    key: &str,
    renamed_to: &str,
    expected: &EntryState,
) -> Result<OpOutcome, StorageError> {
    let path = ctx.local(key);
    let target = ctx.local(renamed_to);
    if !local_matches(read_local(&path).await?.as_ref(), Some(expected)) {
        return Ok(stale(key, "local entry changed since the scan"));
    }
    if read_local(&target).await?.is_some() {
        return Ok(stale(key, "conflict name is already taken"));
    }

    info!("Preserving local copy of {:?} as {:?}", key, renamed_to);
    fs::rename(&path, &target).await?;

    if expected.is_dir() {
        return Ok(OpOutcome::Applied(None));
    }

    let local = match read_local(&target).await? {
        Some(state) => state,
        None => return Ok(stale(renamed_to, "preserved file vanished")),
    };
    upload(ctx, renamed_to, &local, None).await
}

fn directory_entry() -> BaselineEntry {
    BaselineEntry {
        local: EntryState::directory(),
        remote: EntryState::directory(),
    }
}
