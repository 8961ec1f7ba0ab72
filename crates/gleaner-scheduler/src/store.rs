//! One-file-per-job persistence.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{JobRecord, SchedulerError};

/// Durable job storage.
///
/// Every job lives in `<dir>/<id>.json`, so a corrupt or half-written record
/// never affects another. Writes go to a temporary file that is synced and
/// then renamed over the record, under a per-record lock.
#[derive(Debug)]
pub struct JobStore {
    dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl JobStore {
    /// Open the store rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, SchedulerError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            locks: DashMap::new(),
        })
    }

    /// Default application data directory.
    pub fn default_home() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gleaner")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for `id`.
    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn temp_path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!(".{id}.json.tmp"))
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(id.to_string()).or_default().clone()
    }

    /// Load every readable record.
    ///
    /// Records that cannot be read or parsed are skipped with a warning, as are
    /// records whose id does not match their file name.
    #[tracing::instrument(skip(self), fields(dir = %self.dir.display()))]
    pub async fn load_all(&self) -> Result<Vec<JobRecord>, SchedulerError> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut jobs = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.starts_with('.') {
                continue;
            }

            let content = match fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable job record");
                    continue;
                }
            };

            match serde_json::from_str::<JobRecord>(&content) {
                Ok(job) if job.id == stem => jobs.push(job),
                Ok(job) => {
                    warn!(path = %path.display(), id = %job.id, "skipping job record with mismatched id");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping corrupt job record");
                }
            }
        }

        debug!(count = jobs.len(), "loaded job records");
        Ok(jobs)
    }

    /// Atomically write `job` to its record file.
    pub async fn save(&self, job: &JobRecord) -> Result<(), SchedulerError> {
        let content =
            serde_json::to_string_pretty(job).map_err(|source| SchedulerError::Serialization {
                id: job.id.clone(),
                source,
            })?;

        let lock = self.lock_for(&job.id);
        let _guard = lock.lock().await;

        let temp_path = self.temp_path_for(&job.id);
        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(content.as_bytes()).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, self.path_for(&job.id)).await
        }
        .await;

        if let Err(source) = written {
            if let Err(e) = fs::remove_file(&temp_path).await
                && e.kind() != ErrorKind::NotFound
            {
                warn!(path = %temp_path.display(), error = %e, "failed to remove temporary record");
            }
            return Err(SchedulerError::Persistence {
                id: job.id.clone(),
                source,
            });
        }
        Ok(())
    }

    /// Remove the record for `id`. Returns whether a record existed.
    pub async fn delete(&self, id: &str) -> Result<bool, SchedulerError> {
        let lock = self.lock_for(id);
        let removed = {
            let _guard = lock.lock().await;
            match fs::remove_file(self.path_for(id)).await {
                Ok(()) => true,
                Err(e) if e.kind() == ErrorKind::NotFound => false,
                Err(source) => {
                    return Err(SchedulerError::Persistence {
                        id: id.to_string(),
                        source,
                    });
                }
            }
        };
        self.locks.remove(id);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScheduleRule;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = JobStore::open(dir.path()).await.unwrap();

        let job = JobRecord::new(
            "Nightly",
            "products",
            Some(ScheduleRule::daily(Utc::now(), 1).unwrap()),
        );
        store.save(&job).await.unwrap();

        assert!(store.path_for(&job.id).exists());
        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded, vec![job]);
    }

    #[tokio::test]
    async fn test_open_creates_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("jobs");
        JobStore::open(&nested).await.unwrap();
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let store = JobStore::open(dir.path()).await.unwrap();

        let mut job = JobRecord::new("A", "c", None);
        store.save(&job).await.unwrap();
        job.name = "B".to_string();
        store.save(&job).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![format!("{}.json", job.id)]);
        assert_eq!(store.load_all().await.unwrap()[0].name, "B");
    }

    #[tokio::test]
    async fn test_corrupt_record_is_skipped() {
        let dir = tempdir().unwrap();
        let store = JobStore::open(dir.path()).await.unwrap();

        let good = JobRecord::new("Good", "c", None);
        store.save(&good).await.unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, good.id);
    }

    #[tokio::test]
    async fn test_mismatched_id_is_skipped() {
        let dir = tempdir().unwrap();
        let store = JobStore::open(dir.path()).await.unwrap();

        let job = JobRecord::new("Moved", "c", None);
        let content = serde_json::to_string(&job).unwrap();
        std::fs::write(dir.path().join("other.json"), content).unwrap();

        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = tempdir().unwrap();
        let store = JobStore::open(dir.path()).await.unwrap();

        let job = JobRecord::new("Gone", "c", None);
        store.save(&job).await.unwrap();

        assert!(store.delete(&job.id).await.unwrap());
        assert!(!store.path_for(&job.id).exists());
        assert!(!store.delete(&job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_save_removes_temp_file() {
        let dir = tempdir().unwrap();
        let store = JobStore::open(dir.path()).await.unwrap();
        let job = JobRecord::new("Blocked", "c", None);

        // A directory where the record belongs makes the final rename fail.
        std::fs::create_dir(store.path_for(&job.id)).unwrap();
        std::fs::write(store.path_for(&job.id).join("keep"), "x").unwrap();

        let result = store.save(&job).await;
        assert!(matches!(result, Err(SchedulerError::Persistence { ref id, .. }) if *id == job.id));
        assert!(!store.temp_path_for(&job.id).exists());
        assert!(store.path_for(&job.id).is_dir());
    }

    #[tokio::test]
    async fn test_save_into_missing_directory_fails() {
        let dir = tempdir().unwrap();
        let jobs = dir.path().join("jobs");
        let store = JobStore::open(&jobs).await.unwrap();
        std::fs::remove_dir(&jobs).unwrap();
        std::fs::write(&jobs, "not a directory").unwrap();

        let job = JobRecord::new("Homeless", "c", None);
        assert!(matches!(
            store.save(&job).await,
            Err(SchedulerError::Persistence { .. })
        ));
        assert!(store.load_all().await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_saves_of_one_record() {
        let dir = tempdir().unwrap();
        let store = Arc::new(JobStore::open(dir.path()).await.unwrap());
        let job = JobRecord::new("Busy", "c", None);

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let mut job = job.clone();
            job.name = format!("write {i}");
            handles.push(tokio::spawn(async move { store.save(&job).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].name.starts_with("write "));
    }
}
