//! Bringing a remote namespace into a local root, and letting go of it again.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use fs2::FileExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::retry::{with_retry, RetryPolicy};
use crate::storage::{Storage, StorageError};
use crate::util::hash_single;

#[derive(Debug, Error)]
pub enum MountError {
    #[error("remote unreachable: {0}")]
    Unreachable(String),
    #[error("remote rejected the credentials: {0}")]
    CredentialsRejected(String),
    #[error("{0:?} is busy: {1}")]
    Busy(PathBuf, String),
    #[error("{0:?} is not empty")]
    NotEmpty(PathBuf),
    #[error("{0:?} is not a directory")]
    NotADirectory(PathBuf),
    #[error("projection of {0:?} was lost")]
    Lost(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    /// The remote stopped answering health probes.
    Lost,
}

impl ProjectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectionStatus::Starting => "starting",
            ProjectionStatus::Running => "running",
            ProjectionStatus::Stopping => "stopping",
            ProjectionStatus::Stopped => "stopped",
            ProjectionStatus::Lost => "lost",
        }
    }
}

impl FromStr for ProjectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(ProjectionStatus::Starting),
            "running" => Ok(ProjectionStatus::Running),
            "stopping" => Ok(ProjectionStatus::Stopping),
            "stopped" => Ok(ProjectionStatus::Stopped),
            "lost" => Ok(ProjectionStatus::Lost),
            _ => Err(format!("unknown projection status: {}", s)),
        }
    }
}

impl fmt::Display for ProjectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ProjectionOptions {
    /// Accept a target that already has contents.
    pub allow_non_empty: bool,
    /// Let other accounts traverse the root (0755 rather than 0700).
    pub allow_other: bool,
    /// Watch the remote from a background task instead of only on demand.
    pub detached: bool,
    pub health_interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failed probes before the projection counts as lost.
    pub max_probe_failures: u32,
}

impl Default for ProjectionOptions {
    fn default() -> Self {
        ProjectionOptions {
            allow_non_empty: false,
            allow_other: false,
            detached: false,
            health_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            max_probe_failures: 3,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The on-disk claim on a root, held locked for as long as the projection lives.
#[derive(Debug)]
struct Marker {
    file: File,
    path: PathBuf,
}

impl Marker {
    fn release(self) -> io::Result<()> {
        FileExt::unlock(&self.file)?;
        drop(self.file);
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

struct ProjectionInner {
    local_root: PathBuf,
    remote: String,
    storage: Storage,
    status: Mutex<ProjectionStatus>,
    consecutive_failures: AtomicU32,
    probe_timeout: Duration,
    max_probe_failures: u32,
    cancel: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
    marker: Mutex<Option<Marker>>,
}

/// A live projection of a remote namespace onto a local root.
#[derive(Clone)]
pub struct Projection {
    inner: Arc<ProjectionInner>,
}

impl fmt::Debug for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Projection")
            .field("local_root", &self.inner.local_root)
            .field("remote", &self.inner.remote)
            .field("status", &self.status())
            .finish()
    }
}

impl Projection {
    pub fn local_root(&self) -> &Path {
        &self.inner.local_root
    }

    pub fn remote(&self) -> &str {
        &self.inner.remote
    }

    pub fn status(&self) -> ProjectionStatus {
        *lock(&self.inner.status)
    }

    fn set_status(&self, status: ProjectionStatus) {
        let mut current = lock(&self.inner.status);
        if *current != status {
            debug!("Projection of {:?} is now {}", self.inner.local_root, status);
            *current = status;
        }
    }

    /// Fails unless the projection is running.
    pub fn ensure_ready(&self) -> Result<(), MountError> {
        match self.status() {
            ProjectionStatus::Running => Ok(()),
            status => {
                debug!("Projection of {:?} is {}", self.inner.local_root, status);
                Err(MountError::Lost(self.inner.local_root.clone()))
            }
        }
    }

    /// Probes the remote once. Enough consecutive failures mark the projection lost.
    pub async fn check_health(&self) -> Result<(), MountError> {
        if self.status() == ProjectionStatus::Lost {
            return Err(MountError::Lost(self.inner.local_root.clone()));
        }
        match probe(&self.inner.storage, self.inner.probe_timeout).await {
            Ok(()) => {
                self.inner.consecutive_failures.store(0, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                let failures = self.inner.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    "Health probe {}/{} for {:?} failed: {}",
                    failures, self.inner.max_probe_failures, self.inner.local_root, e
                );
                if failures >= self.inner.max_probe_failures {
                    error!("Lost the projection of {:?}", self.inner.local_root);
                    self.set_status(ProjectionStatus::Lost);
                    Err(MountError::Lost(self.inner.local_root.clone()))
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn shut_down(&self) -> Result<(), MountError> {
        self.set_status(ProjectionStatus::Stopping);
        self.inner.cancel.cancel();

        let monitor = lock(&self.inner.monitor).take();
        if let Some(handle) = monitor {
            if let Err(e) = handle.await {
                warn!("Health monitor for {:?} ended badly: {}", self.inner.local_root, e);
            }
        }

        let marker = lock(&self.inner.marker).take();
        if let Some(marker) = marker {
            marker.release()?;
        }
        self.set_status(ProjectionStatus::Stopped);
        info!("Released projection of {:?}", self.inner.local_root);
        Ok(())
    }
}

async fn probe(storage: &Storage, timeout: Duration) -> Result<(), MountError> {
    match with_retry(&RetryPolicy::once(timeout), "probe", || storage.probe()).await {
        Ok(()) => Ok(()),
        Err(StorageError::Unauthorized(message)) => Err(MountError::CredentialsRejected(message)),
        Err(e) => Err(MountError::Unreachable(e.to_string())),
    }
}

async fn monitor(projection: Projection, interval: Duration) {
    let cancel = projection.inner.cancel.clone();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                if let Err(MountError::Lost(_)) = projection.check_health().await {
                    break;
                }
            }
        }
    }
    trace!("Health monitor for {:?} stopped", projection.inner.local_root);
}

/// Establishes and tears down projections, one per local root.
pub struct ProjectionManager {
    state_dir: PathBuf,
    active: Mutex<HashMap<PathBuf, Projection>>,
}

impl ProjectionManager {
    pub fn new(state_dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&state_dir)?;
        Ok(ProjectionManager {
            state_dir,
            active: Mutex::new(HashMap::new()),
        })
    }

    fn marker_for(&self, local_root: &Path) -> PathBuf {
        self.state_dir.join(format!("{:016x}.projection", hash_single(local_root)))
    }

    pub fn get(&self, local_root: &Path) -> Option<Projection> {
        lock(&self.active).get(local_root).cloned()
    }

    /// Makes `storage` usable through `local_root`.
    ///
    /// Establishing an already-running projection against the same remote
    /// returns it; a marker left by a process that died is taken over.
    pub async fn establish(
        &self,
        storage: Storage,
        local_root: &Path,
        options: &ProjectionOptions,
    ) -> Result<Projection, MountError> {
        let remote = storage.describe();

        if let Some(existing) = self.get(local_root) {
            if existing.remote() != remote {
                return Err(MountError::Busy(
                    local_root.to_path_buf(),
                    format!("already projecting {}", existing.remote()),
                ));
            }
            if existing.status() == ProjectionStatus::Running {
                debug!("Reusing projection of {:?}", local_root);
                return Ok(existing);
            }
            info!("Re-establishing {} projection of {:?}", existing.status(), local_root);
            self.teardown(local_root).await?;
        }

        match fs::metadata(local_root) {
            Ok(metadata) if !metadata.is_dir() => return Err(MountError::NotADirectory(local_root.to_path_buf())),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("Creating {:?}", local_root);
                fs::create_dir_all(local_root)?;
            }
            Err(e) => return Err(e.into()),
        }

        let marker_path = self.marker_for(local_root);
        let recovering = marker_path.exists();
        let file = OpenOptions::new().create(true).write(true).truncate(false).open(&marker_path)?;
        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(MountError::Busy(local_root.to_path_buf(), "projected by another process".to_owned()));
            }
            return Err(e.into());
        }
        let marker = Marker { file, path: marker_path };
        if recovering {
            warn!("Recovering projection of {:?} left behind by a previous process", local_root);
        }

        if let Err(e) = self.prepare(&storage, local_root, options, recovering).await {
            if let Err(release) = marker.release() {
                warn!("Failed to release projection marker: {}", release);
            }
            return Err(e);
        }
        write_marker(&marker, local_root, &remote)?;

        let projection = Projection {
            inner: Arc::new(ProjectionInner {
                local_root: local_root.to_path_buf(),
                remote,
                storage,
                status: Mutex::new(ProjectionStatus::Starting),
                consecutive_failures: AtomicU32::new(0),
                probe_timeout: options.probe_timeout,
                max_probe_failures: options.max_probe_failures.max(1),
                cancel: CancellationToken::new(),
                monitor: Mutex::new(None),
                marker: Mutex::new(Some(marker)),
            }),
        };
        projection.set_status(ProjectionStatus::Running);

        if options.detached {
            let handle = tokio::spawn(monitor(projection.clone(), options.health_interval));
            *lock(&projection.inner.monitor) = Some(handle);
        }

        info!("Projected {} onto {:?}", projection.remote(), local_root);
        lock(&self.active).insert(local_root.to_path_buf(), projection.clone());
        Ok(projection)
    }

    async fn prepare(
        &self,
        storage: &Storage,
        local_root: &Path,
        options: &ProjectionOptions,
        recovering: bool,
    ) -> Result<(), MountError> {
        if !options.allow_non_empty && !recovering && fs::read_dir(local_root)?.next().is_some() {
            return Err(MountError::NotEmpty(local_root.to_path_buf()));
        }

        probe(storage, options.probe_timeout).await?;

        set_root_permissions(local_root, options.allow_other)?;
        Ok(())
    }

    /// Releases the projection of `local_root`. Safe to repeat, and safe
    /// after an `establish` that failed half way.
    pub async fn teardown(&self, local_root: &Path) -> Result<(), MountError> {
        let existing = lock(&self.active).remove(local_root);
        if let Some(projection) = existing {
            return projection.shut_down().await;
        }

        let marker_path = self.marker_for(local_root);
        let file = match File::open(&marker_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Nothing projected onto {:?}", local_root);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(MountError::Busy(local_root.to_path_buf(), "projected by another process".to_owned()));
            }
            return Err(e.into());
        }
        info!("Removing stale projection marker for {:?}", local_root);
        Marker { file, path: marker_path }.release()?;
        Ok(())
    }
}

fn write_marker(marker: &Marker, local_root: &Path, remote: &str) -> io::Result<()> {
    let mut file = &marker.file;
    file.set_len(0)?;
    writeln!(file, "{}", local_root.display())?;
    writeln!(file, "{}", remote)?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()
}

#[cfg(unix)]
fn set_root_permissions(local_root: &Path, allow_other: bool) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if allow_other { 0o755 } else { 0o700 };
    fs::set_permissions(local_root, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_root_permissions(_: &Path, _: bool) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use crate::storage::{ByteStream, ObjectStoreClient, RemoteObject, StorageClient};

    /// Rejects every request, like a bucket with the wrong keys.
    #[derive(Debug)]
    struct Rejecting;

    #[async_trait]
    impl StorageClient for Rejecting {
        async fn list(&self) -> Result<Vec<RemoteObject>, StorageError> {
            Err(StorageError::Unauthorized("403 Forbidden".into()))
        }
        async fn stat(&self, _: &str) -> Result<Option<RemoteObject>, StorageError> {
            Err(StorageError::Unauthorized("403 Forbidden".into()))
        }
        async fn get(&self, _: &str) -> Result<ByteStream, StorageError> {
            Err(StorageError::Unauthorized("403 Forbidden".into()))
        }
        async fn put(&self, _: &str, _: Bytes) -> Result<RemoteObject, StorageError> {
            Err(StorageError::Unauthorized("403 Forbidden".into()))
        }
        async fn put_file(&self, _: &str, _: &Path) -> Result<RemoteObject, StorageError> {
            Err(StorageError::Unauthorized("403 Forbidden".into()))
        }
        async fn delete(&self, _: &str) -> Result<(), StorageError> {
            Err(StorageError::Unauthorized("403 Forbidden".into()))
        }
        async fn probe(&self) -> Result<(), StorageError> {
            Err(StorageError::Unauthorized("403 Forbidden".into()))
        }
        fn describe(&self) -> String {
            "rejecting://".into()
        }
    }

    fn memory() -> Storage {
        Arc::new(ObjectStoreClient::in_memory())
    }

    #[tokio::test]
    async fn establish_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProjectionManager::new(dir.path().join("state")).unwrap();
        let root = dir.path().join("home");
        let storage = memory();

        let first = manager.establish(storage.clone(), &root, &ProjectionOptions::default()).await.unwrap();
        let second = manager.establish(storage, &root, &ProjectionOptions::default()).await.unwrap();
        assert!(Arc::ptr_eq(&first.inner, &second.inner));
        assert_eq!(first.status(), ProjectionStatus::Running);
        assert!(root.is_dir());

        let other = manager.establish(Arc::new(Rejecting), &root, &ProjectionOptions::default()).await;
        assert!(matches!(other, Err(MountError::Busy(..))));
    }

    #[tokio::test]
    async fn non_empty_target_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProjectionManager::new(dir.path().join("state")).unwrap();
        let root = dir.path().join("home");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("existing.txt"), b"x").unwrap();

        let result = manager.establish(memory(), &root, &ProjectionOptions::default()).await;
        assert!(matches!(result, Err(MountError::NotEmpty(_))));

        let options = ProjectionOptions {
            allow_non_empty: true,
            ..Default::default()
        };
        assert!(manager.establish(memory(), &root, &options).await.is_ok());
    }

    #[tokio::test]
    async fn file_target_is_not_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProjectionManager::new(dir.path().join("state")).unwrap();
        let root = dir.path().join("file");
        fs::write(&root, b"x").unwrap();

        let result = manager.establish(memory(), &root, &ProjectionOptions::default()).await;
        assert!(matches!(result, Err(MountError::NotADirectory(_))));
    }

    #[tokio::test]
    async fn rejected_credentials_leave_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProjectionManager::new(dir.path().join("state")).unwrap();
        let root = dir.path().join("home");

        let result = manager.establish(Arc::new(Rejecting), &root, &ProjectionOptions::default()).await;
        assert!(matches!(result, Err(MountError::CredentialsRejected(_))));
        assert!(!manager.marker_for(&root).exists());
        manager.teardown(&root).await.unwrap();
    }

    #[tokio::test]
    async fn teardown_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProjectionManager::new(dir.path().join("state")).unwrap();
        let root = dir.path().join("home");
        let options = ProjectionOptions {
            detached: true,
            ..Default::default()
        };

        let projection = manager.establish(memory(), &root, &options).await.unwrap();
        manager.teardown(&root).await.unwrap();
        manager.teardown(&root).await.unwrap();

        assert_eq!(projection.status(), ProjectionStatus::Stopped);
        assert!(projection.ensure_ready().is_err());
        assert!(!manager.marker_for(&root).exists());
    }

    #[tokio::test]
    async fn live_marker_in_another_manager_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let first = ProjectionManager::new(dir.path().join("state")).unwrap();
        let second = ProjectionManager::new(dir.path().join("state")).unwrap();
        let root = dir.path().join("home");

        first.establish(memory(), &root, &ProjectionOptions::default()).await.unwrap();
        let result = second.establish(memory(), &root, &ProjectionOptions::default()).await;
        assert!(matches!(result, Err(MountError::Busy(..))));
        assert!(matches!(second.teardown(&root).await, Err(MountError::Busy(..))));
    }

    #[tokio::test]
    async fn leftover_marker_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProjectionManager::new(dir.path().join("state")).unwrap();
        let root = dir.path().join("home");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("synced.txt"), b"x").unwrap();
        fs::write(manager.marker_for(&root), b"stale").unwrap();

        // a crashed process leaves a populated root and an unlocked marker
        let projection = manager.establish(memory(), &root, &ProjectionOptions::default()).await.unwrap();
        assert_eq!(projection.status(), ProjectionStatus::Running);
    }

    #[tokio::test]
    async fn repeated_probe_failures_lose_the_projection() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProjectionManager::new(dir.path().join("state")).unwrap();
        let root = dir.path().join("home");

        let projection = manager.establish(memory(), &root, &ProjectionOptions::default()).await.unwrap();
        // swap in a remote that has started rejecting requests
        let broken = Projection {
            inner: Arc::new(ProjectionInner {
                local_root: root.clone(),
                remote: projection.remote().to_owned(),
                storage: Arc::new(Rejecting),
                status: Mutex::new(ProjectionStatus::Running),
                consecutive_failures: AtomicU32::new(0),
                probe_timeout: Duration::from_secs(1),
                max_probe_failures: 2,
                cancel: CancellationToken::new(),
                monitor: Mutex::new(None),
                marker: Mutex::new(None),
            }),
        };

        assert!(matches!(broken.check_health().await, Err(MountError::CredentialsRejected(_))));
        assert!(broken.ensure_ready().is_ok());
        assert!(matches!(broken.check_health().await, Err(MountError::Lost(_))));
        assert!(matches!(broken.ensure_ready(), Err(MountError::Lost(_))));
    }
}
