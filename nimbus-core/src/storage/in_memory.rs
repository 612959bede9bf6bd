//! An in-memory implementation of [`Storage`].
//!
//! The [`InMemoryStorage`] is cloneable; every clone refers to the same
//! underlying buckets.
use std::{collections::BTreeMap, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use super::Storage;

/// ```
/// use nimbus::storage::{Storage, in_memory::InMemoryStorage};
/// use bytes::Bytes;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let storage = InMemoryStorage::default();
///     storage.put("bucket", "logs/a.txt", Bytes::from_static(b"hello")).await?;
///     assert_eq!(storage.head("bucket", "logs/a.txt").await?, 5);
///     assert_eq!(storage.list("bucket", "logs/").await?, vec!["logs/a.txt"]);
///     Ok(())
/// }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    buckets: Arc<DashMap<String, BTreeMap<String, Bytes>>>,
}

impl InMemoryStorage {
    /// Total number of objects across all buckets.
    pub fn object_count(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> Result<()> {
        self.buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes> {
        self.buckets
            .get(bucket)
            .and_then(|objects| objects.get(key).cloned())
            .ok_or_else(|| anyhow!("no such object: {bucket}/{key}"))
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<u64> {
        self.get(bucket, key).await.map(|data| data.len() as u64)
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .buckets
            .get(bucket)
            .map(|objects| {
                objects
                    .range(prefix.to_string()..)
                    .take_while(|(key, _)| key.starts_with(prefix))
                    .map(|(key, _)| key.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(&self, bucket: &str, keys: &[String]) -> Result<()> {
        if let Some(mut objects) = self.buckets.get_mut(bucket) {
            for key in keys {
                objects.remove(key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_is_prefix_scoped_and_sorted() {
        let storage = InMemoryStorage::default();
        for key in ["b/2", "a/1", "b/1", "bb/1"] {
            storage.put("x", key, Bytes::new()).await.unwrap();
        }
        assert_eq!(storage.list("x", "b/").await.unwrap(), vec!["b/1", "b/2"]);
        assert!(storage.list("y", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_ignores_missing_keys() {
        let storage = InMemoryStorage::default();
        storage.put("x", "k", Bytes::new()).await.unwrap();
        storage
            .delete("x", &["k".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert!(storage.get("x", "k").await.is_err());
        assert_eq!(storage.object_count(), 0);
    }
}
