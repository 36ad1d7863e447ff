//! The remote side: a bucket reached through the `object_store` crate.

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore, PutPayload, RetryConfig, WriteMultipart};
use thiserror::Error;
use tokio::io::AsyncReadExt;

use crate::config::RemoteConfig;
use crate::state::EntryState;

/// Zero-byte object that materializes an otherwise empty remote directory.
pub const DIRECTORY_MARKER: &str = ".s3ftp-dir";

/// Files larger than this are uploaded in parts.
const MULTIPART_THRESHOLD: u64 = 16 * 1024 * 1024;
const PART_SIZE: usize = 8 * 1024 * 1024;
const MAX_PARTS_IN_FLIGHT: usize = 4;
const READ_BUFFER: usize = 64 * 1024;

pub type ByteStream = BoxStream<'static, Result<Bytes, StorageError>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("credentials rejected: {0}")]
    Unauthorized(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("storage error: {0}")]
    Other(String),
    #[error("local io error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Timeout(_) | StorageError::Transient(_))
    }
}

impl From<object_store::Error> for StorageError {
    fn from(e: object_store::Error) -> Self {
        let message = e.to_string();
        match e {
            object_store::Error::NotFound { path, .. } => StorageError::NotFound(path),
            object_store::Error::PermissionDenied { .. } | object_store::Error::Unauthenticated { .. } => {
                StorageError::Unauthorized(message)
            }
            object_store::Error::Generic { .. } => classify_generic(message),
            _ => StorageError::Other(message),
        }
    }
}

/// Generic errors carry the HTTP status in their message, if there was a response at all.
fn classify_generic(message: String) -> StorageError {
    match response_status(&message) {
        Some(401) | Some(403) => StorageError::Unauthorized(message),
        Some(408) | Some(429) => StorageError::Transient(message),
        Some(status) if (400..500).contains(&status) => StorageError::Other(message),
        // 5xx, or no response: connection reset, DNS failure and so on
        _ => StorageError::Transient(message),
    }
}

fn response_status(message: &str) -> Option<u16> {
    ["with status ", "status client error (", "status server error ("]
        .iter()
        .find_map(|needle| {
            let start = message.find(needle)? + needle.len();
            let digits = message.get(start..start + 3)?;
            digits.parse().ok()
        })
}

/// Whether `key` can name an object. Control characters, empty segments and
/// `.`/`..` segments cannot.
pub fn is_storable_key(key: &str) -> bool {
    !key.is_empty() && ObjectPath::parse(key).is_ok()
}

/// One object as listed by the store, keyed relative to the configured prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub e_tag: Option<String>,
}

impl RemoteObject {
    pub fn state(&self) -> EntryState {
        EntryState::file(self.size, Some(self.last_modified.timestamp_millis()), self.e_tag.clone())
    }
}

/// Authenticated access to one remote namespace.
#[async_trait]
pub trait StorageClient: Send + Sync + fmt::Debug {
    /// Every object beneath the namespace, including directory markers.
    async fn list(&self) -> Result<Vec<RemoteObject>, StorageError>;

    async fn stat(&self, key: &str) -> Result<Option<RemoteObject>, StorageError>;

    async fn get(&self, key: &str) -> Result<ByteStream, StorageError>;

    async fn put(&self, key: &str, data: Bytes) -> Result<RemoteObject, StorageError>;

    async fn put_file(&self, key: &str, path: &Path) -> Result<RemoteObject, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn probe(&self) -> Result<(), StorageError>;

    /// Identifies the remote namespace, used to detect conflicting projections.
    fn describe(&self) -> String;
}

pub type Storage = Arc<dyn StorageClient>;

/// `StorageClient` backed by any `object_store` implementation.
pub struct ObjectStoreClient {
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
    name: String,
}

impl fmt::Debug for ObjectStoreClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreClient")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl ObjectStoreClient {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: Option<String>, name: String) -> Self {
        let prefix = prefix
            .map(|p| p.trim_matches('/').to_owned())
            .filter(|p| !p.is_empty());
        ObjectStoreClient { store, prefix, name }
    }

    /// An S3-compatible bucket.
    pub fn s3(config: &RemoteConfig) -> Result<Self, StorageError> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_allow_http(config.allow_http);
        if let Some(ref endpoint) = config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        if let Some(ref key) = config.access_key_id {
            builder = builder.with_access_key_id(key);
        }
        if let Some(ref secret) = config.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }
        if let Some(ref prefix) = config.prefix {
            let trimmed = prefix.trim_matches('/');
            if !trimmed.is_empty() && !is_storable_key(trimmed) {
                return Err(StorageError::Other(format!("invalid prefix {:?}", prefix)));
            }
        }
        // Failed requests are retried by the sync engine, with its own backoff.
        builder = builder.with_retry(RetryConfig {
            max_retries: 0,
            ..Default::default()
        });
        let store = builder.build()?;
        let name = match config.endpoint {
            Some(ref endpoint) => format!("s3://{}@{}", config.bucket, endpoint),
            None => format!("s3://{}", config.bucket),
        };
        Ok(ObjectStoreClient::new(Arc::new(store), config.prefix.clone(), name))
    }

    pub fn in_memory() -> Self {
        ObjectStoreClient::new(Arc::new(InMemory::new()), None, "memory://".to_owned())
    }

    /// Keys are used verbatim; `ObjectPath::from` would percent-encode them.
    fn location(&self, key: &str) -> Result<ObjectPath, StorageError> {
        let full = match self.prefix {
            Some(ref prefix) => format!("{}/{}", prefix, key),
            None => key.to_owned(),
        };
        ObjectPath::parse(&full).map_err(|e| StorageError::Other(format!("invalid key {:?}: {}", key, e)))
    }

    fn prefix_path(&self) -> Result<Option<ObjectPath>, StorageError> {
        self.prefix
            .as_deref()
            .map(|prefix| ObjectPath::parse(prefix).map_err(|e| StorageError::Other(e.to_string())))
            .transpose()
    }

    fn stored(&self, meta: ObjectMeta) -> Result<RemoteObject, StorageError> {
        let location = meta.location.clone();
        self.remote_object(meta)
            .ok_or_else(|| StorageError::Other(format!("{} was stored outside the prefix", location)))
    }

    fn strip_prefix(&self, location: &ObjectPath) -> Option<String> {
        let full = location.as_ref();
        match self.prefix {
            Some(ref prefix) => full
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .map(str::to_owned),
            None => Some(full.to_owned()),
        }
    }

    fn remote_object(&self, meta: ObjectMeta) -> Option<RemoteObject> {
        let key = self.strip_prefix(&meta.location)?;
        Some(RemoteObject {
            key,
            size: meta.size as u64,
            last_modified: meta.last_modified,
            e_tag: meta.e_tag,
        })
    }
}

#[async_trait]
impl StorageClient for ObjectStoreClient {
    async fn list(&self) -> Result<Vec<RemoteObject>, StorageError> {
        let prefix = self.prefix_path()?;
        let metas: Vec<ObjectMeta> = self.store.list(prefix.as_ref()).try_collect().await?;
        trace!("Listed {} objects in {}", metas.len(), self.name);
        Ok(metas.into_iter().filter_map(|meta| self.remote_object(meta)).collect())
    }

    async fn stat(&self, key: &str) -> Result<Option<RemoteObject>, StorageError> {
        match self.store.head(&self.location(key)?).await {
            Ok(meta) => Ok(self.remote_object(meta)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, key: &str) -> Result<ByteStream, StorageError> {
        let result = self.store.get(&self.location(key)?).await?;
        Ok(result.into_stream().map_err(StorageError::from).boxed())
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<RemoteObject, StorageError> {
        let location = self.location(key)?;
        self.store.put(&location, PutPayload::from(data)).await?;
        self.stored(self.store.head(&location).await?)
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<RemoteObject, StorageError> {
        let location = self.location(key)?;
        let mut file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();

        if size <= MULTIPART_THRESHOLD {
            let mut data = Vec::with_capacity(size as usize);
            file.read_to_end(&mut data).await?;
            self.store.put(&location, PutPayload::from(data)).await?;
        } else {
            debug!("Uploading {} bytes to {} in parts", size, location);
            let upload = self.store.put_multipart(&location).await?;
            let mut writer = WriteMultipart::new_with_chunk_size(upload, PART_SIZE);
            if let Err(e) = write_parts(&mut file, &mut writer).await {
                if let Err(abort) = writer.abort().await {
                    warn!("Failed to abort upload of {}: {}", location, abort);
                }
                return Err(e);
            }
            writer.finish().await?;
        }

        self.stored(self.store.head(&location).await?)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match self.store.delete(&self.location(key)?).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn probe(&self) -> Result<(), StorageError> {
        let prefix = self.prefix_path()?;
        self.store.list_with_delimiter(prefix.as_ref()).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        match self.prefix {
            Some(ref prefix) => format!("{}/{}", self.name, prefix),
            None => self.name.clone(),
        }
    }
}

async fn write_parts(file: &mut tokio::fs::File, writer: &mut WriteMultipart) -> Result<(), StorageError> {
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            return Ok(());
        }
        writer.wait_for_capacity(MAX_PARTS_IN_FLIGHT).await?;
        writer.write(&buffer[..read]);
    }
}
