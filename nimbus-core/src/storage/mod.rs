//! Object storage as seen by the job pipeline.
//!
//! The pipeline needs very little from a storage service: store a blob, read
//! it back, measure it, list a prefix and delete keys. [`Storage`] captures
//! exactly that, so any object store (or a local directory) can back a
//! session.
//!
//! # Implementations
//! - [`InMemoryStorage`](in_memory::InMemoryStorage): a process-local store,
//!   useful for tests and for embedding.
//! - [`LocalStorage`](local::LocalStorage): a directory tree laid out as
//!   `<root>/<bucket>/<key>`. The localhost backend uses it so that execution
//!   environments can read job artifacts directly from disk.
//!
//! [`InternalStorage`] binds a handle to the session bucket and adds upload
//! retries on top of it.
use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{instrument, warn};

use crate::config::Config;

pub mod in_memory;
pub mod keys;
pub mod local;

/// A handle to an object storage service.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Store `data` under `key`, replacing any previous object.
    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> Result<()>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes>;

    /// The size of the object in bytes. Fails if the object doesn't exist.
    async fn head(&self, bucket: &str, key: &str) -> Result<u64>;

    /// Every key under `prefix`, in lexicographic order.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    /// Remove `keys`. Keys that don't exist are ignored.
    async fn delete(&self, bucket: &str, keys: &[String]) -> Result<()>;
}

/// A reference to a stored object or, when the key is empty or ends with `/`,
/// to every object under a prefix.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    /// Parses `"<bucket>/<key>"`, optionally preceded by a `<scheme>://`.
    pub fn parse(reference: &str) -> Result<Self> {
        let path = reference
            .split_once("://")
            .map_or(reference, |(_, path)| path);
        let (bucket, key) = path.split_once('/').unwrap_or((path, ""));
        if bucket.is_empty() {
            return Err(anyhow!("object reference `{reference}` has no bucket"));
        }

        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    pub fn is_prefix(&self) -> bool {
        self.key.is_empty() || self.key.ends_with('/')
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// A storage handle bound to the session bucket.
#[derive(Clone)]
pub struct InternalStorage {
    storage: Arc<dyn Storage>,
    bucket: String,
    retry: Option<Duration>,
}

impl InternalStorage {
    pub fn new(storage: Arc<dyn Storage>, bucket: impl Into<String>) -> Self {
        Self {
            storage,
            bucket: bucket.into(),
            retry: None,
        }
    }

    pub fn from_config(storage: Arc<dyn Storage>, config: &Config) -> Self {
        Self::new(storage, config.storage_bucket.clone())
            .with_upload_retry(Duration::from_secs(config.upload_retry_secs))
    }

    /// Retry failed uploads with exponential backoff for at most `max_elapsed`.
    /// A zero duration disables retries.
    pub fn with_upload_retry(mut self, max_elapsed: Duration) -> Self {
        self.retry = (!max_elapsed.is_zero()).then_some(max_elapsed);
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Upload an aggregated data blob.
    pub async fn put_data(&self, key: &str, data: Bytes) -> Result<()> {
        self.put_with_retry(key, data).await
    }

    /// Upload a serialized computation unit.
    pub async fn put_func(&self, key: &str, data: Bytes) -> Result<()> {
        self.put_with_retry(key, data).await
    }

    pub async fn get(&self, key: &str) -> Result<Bytes> {
        self.storage.get(&self.bucket, key).await
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.storage.list(&self.bucket, prefix).await
    }

    pub async fn delete(&self, keys: &[String]) -> Result<()> {
        self.storage.delete(&self.bucket, keys).await
    }

    #[instrument(skip(self, data), fields(bucket = %self.bucket, size = data.len()), level = "debug")]
    async fn put_with_retry(&self, key: &str, data: Bytes) -> Result<()> {
        let Some(max_elapsed) = self.retry else {
            return self.storage.put(&self.bucket, key, data).await;
        };

        let policy = backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(100))
            .with_max_elapsed_time(Some(max_elapsed))
            .build();

        let storage = &self.storage;
        let bucket = self.bucket.as_str();
        backoff::future::retry(policy, || {
            let data = data.clone();
            async move {
                storage.put(bucket, key, data).await.map_err(|err| {
                    warn!(key, "upload failed, retrying: {err:#}");
                    backoff::Error::transient(err)
                })
            }
        })
        .await
    }
}
