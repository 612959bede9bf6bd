//! Out-of-band removal of job artifacts.
//!
//! Cleanup requests are spooled to disk before the worker is notified, so a
//! request survives the process that made it: whatever is left in the spool
//! directory is processed the next time a worker starts. Nothing here ever
//! fails the caller. Errors are logged and the request is dropped.
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::CleanupError,
    storage::{keys, InternalStorage},
};

/// Spool directory, relative to the storage directory.
pub const SPOOL_DIR: &str = "cleanup";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CleanupRequest {
    /// `(executor_id, job_id)` pairs.
    jobs: Vec<(String, String)>,
    clean_cloudobjects: bool,
}

/// Producer side of the cleanup worker.
#[derive(Clone, Debug)]
pub struct CleanupQueue {
    spool_dir: PathBuf,
    notify: mpsc::UnboundedSender<()>,
    seq: Arc<AtomicU64>,
}

impl CleanupQueue {
    /// Spool a request to remove the artifacts of `jobs`, and their temporary
    /// outputs if `clean_cloudobjects` is set.
    ///
    /// Returns the spool file, or `None` if the request could not be written.
    pub async fn enqueue(
        &self,
        jobs: &[(String, String)],
        clean_cloudobjects: bool,
    ) -> Option<PathBuf> {
        if jobs.is_empty() {
            return None;
        }
        let request = CleanupRequest {
            jobs: jobs.to_vec(),
            clean_cloudobjects,
        };
        match self.spool(&request).await {
            Ok(path) => {
                debug!(path = %path.display(), jobs = jobs.len(), "cleanup request spooled");
                if self.notify.send(()).is_err() {
                    warn!("cleanup worker is gone, request left in spool");
                }
                Some(path)
            }
            Err(err) => {
                warn!("failed to spool cleanup request: {err:#}");
                None
            }
        }
    }

    async fn spool(&self, request: &CleanupRequest) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.spool_dir).await?;
        let name = format!(
            "{}-{}-{:06}",
            Utc::now().format("%Y%m%d%H%M%S%6f"),
            std::process::id(),
            self.seq.fetch_add(1, Ordering::Relaxed)
        );
        let tmp = self.spool_dir.join(format!("{name}.tmp"));
        let path = self.spool_dir.join(format!("{name}.json"));
        tokio::fs::write(&tmp, serde_json::to_vec(request)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path)
    }
}

/// The background task removing spooled jobs.
pub struct JobCleaner {
    storage: InternalStorage,
    spool_dir: PathBuf,
}

impl JobCleaner {
    /// Start a worker over `spool_dir`. The worker first drains leftover
    /// requests and exits once every [`CleanupQueue`] clone is dropped.
    pub fn spawn(
        storage: InternalStorage,
        spool_dir: impl Into<PathBuf>,
    ) -> (CleanupQueue, JoinHandle<()>) {
        let spool_dir = spool_dir.into();
        let (notify, mut notifications) = mpsc::unbounded_channel();
        let queue = CleanupQueue {
            spool_dir: spool_dir.clone(),
            notify,
            seq: Arc::new(AtomicU64::new(0)),
        };
        let cleaner = Self { storage, spool_dir };

        let handle = tokio::spawn(async move {
            cleaner.drain().await;
            while notifications.recv().await.is_some() {
                // Coalesce bursts into one pass over the spool.
                while notifications.try_recv().is_ok() {}
                cleaner.drain().await;
            }
            debug!("cleanup worker stopped");
        });
        (queue, handle)
    }

    /// [`spawn`](Self::spawn) over `<storage dir>/cleanup`.
    pub fn from_config(storage: InternalStorage, config: &Config) -> (CleanupQueue, JoinHandle<()>) {
        Self::spawn(storage, config.storage_dir.join(SPOOL_DIR))
    }

    async fn drain(&self) {
        let files = match spooled_requests(&self.spool_dir).await {
            Ok(files) => files,
            Err(err) => {
                warn!(spool = %self.spool_dir.display(), "cannot read cleanup spool: {err}");
                return;
            }
        };
        for path in files {
            if let Err(err) = self.process(&path).await {
                warn!(path = %path.display(), "cleanup failed: {:#}", anyhow::Error::from(err));
            }
            if let Err(err) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), "failed to remove cleanup request: {err}");
            }
        }
    }

    async fn process(&self, path: &Path) -> Result<(), CleanupError> {
        let contents = tokio::fs::read(path).await?;
        let request: CleanupRequest =
            serde_json::from_slice(&contents).map_err(|err| CleanupError::MalformedRequest {
                path: path.display().to_string(),
                source: err.into(),
            })?;

        for (executor_id, job_id) in &request.jobs {
            match self
                .clean_job(executor_id, job_id, request.clean_cloudobjects)
                .await
            {
                Ok(removed) => info!(%executor_id, %job_id, removed, "job artifacts removed"),
                // One failing job doesn't keep the others around.
                Err(err) => warn!("{:#}", anyhow::Error::from(err)),
            }
        }
        Ok(())
    }

    async fn clean_job(
        &self,
        executor_id: &str,
        job_id: &str,
        clean_cloudobjects: bool,
    ) -> Result<usize, CleanupError> {
        let mut prefixes = vec![keys::job_prefix(executor_id, job_id)];
        if clean_cloudobjects {
            prefixes.push(keys::temp_prefix(executor_id, job_id));
        }

        let mut removed = 0;
        for prefix in prefixes {
            let result = async {
                let found = self.storage.list(&prefix).await?;
                if !found.is_empty() {
                    self.storage.delete(&found).await?;
                }
                anyhow::Ok(found.len())
            }
            .await;
            removed += result.map_err(|source| CleanupError::Delete {
                executor_id: executor_id.to_string(),
                job_id: job_id.to_string(),
                source,
            })?;
        }
        Ok(removed)
    }
}

/// Completed request files, oldest first.
async fn spooled_requests(spool_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(spool_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => return Err(err),
    };
    let mut files = vec![];
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::storage::{in_memory::InMemoryStorage, Storage};

    const BUCKET: &str = "bucket";

    async fn seeded() -> InMemoryStorage {
        let storage = InMemoryStorage::default();
        for key in [
            keys::agg_data_key("exec", "M000"),
            keys::func_key("exec", "M000"),
            format!("{}out-0", keys::temp_prefix("exec", "M000")),
            keys::agg_data_key("exec", "M001"),
        ] {
            storage.put(BUCKET, &key, Bytes::from_static(b"x")).await.unwrap();
        }
        storage
    }

    async fn remaining(storage: &InMemoryStorage) -> Vec<String> {
        storage.list(BUCKET, "").await.unwrap()
    }

    #[tokio::test]
    async fn removes_spooled_jobs() {
        crate::init_test_tracing();
        let dir = tempfile::tempdir().unwrap();
        let storage = seeded().await;
        let (queue, worker) = JobCleaner::spawn(
            InternalStorage::new(Arc::new(storage.clone()), BUCKET),
            dir.path(),
        );

        let spooled = queue
            .enqueue(&[("exec".to_string(), "M000".to_string())], false)
            .await
            .unwrap();
        assert_eq!(spooled.extension().unwrap(), "json");
        drop(queue);
        worker.await.unwrap();

        assert_eq!(
            remaining(&storage).await,
            vec![
                keys::agg_data_key("exec", "M001"),
                format!("{}out-0", keys::temp_prefix("exec", "M000")),
            ]
        );
        assert!(!spooled.exists());
    }

    #[tokio::test]
    async fn leftover_requests_are_drained_at_start() {
        let dir = tempfile::tempdir().unwrap();
        let request = CleanupRequest {
            jobs: vec![("exec".into(), "M000".into()), ("exec".into(), "M001".into())],
            clean_cloudobjects: true,
        };
        std::fs::write(
            dir.path().join("0-left-over.json"),
            serde_json::to_vec(&request).unwrap(),
        )
        .unwrap();
        let storage = seeded().await;

        let (queue, worker) = JobCleaner::spawn(
            InternalStorage::new(Arc::new(storage.clone()), BUCKET),
            dir.path(),
        );
        drop(queue);
        worker.await.unwrap();

        assert!(remaining(&storage).await.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn malformed_requests_are_dropped() {
        crate::init_test_tracing();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), b"not json").unwrap();
        let storage = seeded().await;

        let (queue, worker) = JobCleaner::spawn(
            InternalStorage::new(Arc::new(storage.clone()), BUCKET),
            dir.path(),
        );
        assert!(queue.enqueue(&[], true).await.is_none());
        drop(queue);
        worker.await.unwrap();

        assert_eq!(storage.object_count(), 4);
        assert!(!dir.path().join("bad.json").exists());
    }
}
