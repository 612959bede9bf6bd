//! A [`Storage`] backed by a local directory tree.
//!
//! Objects live at `<root>/<bucket>/<key>`; `/` in keys maps to directory
//! separators.
use std::{
    io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use walkdir::WalkDir;

use super::Storage;

#[derive(Clone, Debug)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The filesystem path of an object.
    pub fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> Result<()> {
        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        tokio::fs::write(&path, &data)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let path = self.object_path(bucket, key);
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(Bytes::from(data))
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<u64> {
        let path = self.object_path(bucket, key);
        let metadata = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("stat {}", path.display()))?;
        anyhow::ensure!(metadata.is_file(), "{} is not an object", path.display());
        Ok(metadata.len())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let bucket_dir = self.root.join(bucket);
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            if !bucket_dir.is_dir() {
                return Ok(Vec::new());
            }
            let mut keys = Vec::new();
            for entry in WalkDir::new(&bucket_dir) {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry.path().strip_prefix(&bucket_dir)?;
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(&prefix) {
                    keys.push(key);
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await?
    }

    async fn delete(&self, bucket: &str, keys: &[String]) -> Result<()> {
        for key in keys {
            let path = self.object_path(bucket, key);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("removing {}", path.display()))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn objects_map_to_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        storage
            .put("bucket", "nimbus.jobs/abc/M000/aggdata.bin", Bytes::from_static(b"123"))
            .await
            .unwrap();
        storage
            .put("bucket", "other/key", Bytes::from_static(b"4"))
            .await
            .unwrap();

        assert!(dir
            .path()
            .join("bucket/nimbus.jobs/abc/M000/aggdata.bin")
            .is_file());
        assert_eq!(
            storage.head("bucket", "nimbus.jobs/abc/M000/aggdata.bin").await.unwrap(),
            3
        );
        assert_eq!(
            storage.list("bucket", "nimbus.jobs/").await.unwrap(),
            vec!["nimbus.jobs/abc/M000/aggdata.bin"]
        );

        storage
            .delete("bucket", &["other/key".to_string(), "gone".to_string()])
            .await
            .unwrap();
        assert!(storage.get("bucket", "other/key").await.is_err());
    }

    #[tokio::test]
    async fn missing_bucket_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        assert!(storage.list("nope", "").await.unwrap().is_empty());
        assert!(storage.head("nope", "k").await.is_err());
    }
}
